/// Option composition for tools invoked as
/// `tool [global options] {[input options] -i input}... {[output options] output}`.
///
/// Produces a list of discrete arguments for [`crate::runner::ProcessRunner::run`],
/// so every value is escaped as one word.
use crate::command::Command;
use crate::escape::{quote, EscapeError};

/// Value of a single `-key` option, decided once when the option is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// `true` emits `-key`, `false` emits nothing.
    Flag(bool),
    /// Emits `-key value`.
    Value(String),
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Flag(b)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Value(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Value(s)
    }
}

macro_rules! option_value_from_number {
    ($($t:ty),*) => {
        $(
            impl From<$t> for OptionValue {
                fn from(n: $t) -> Self {
                    OptionValue::Value(n.to_string())
                }
            }
        )*
    };
}

option_value_from_number!(i32, i64, u32, u64, usize, f32, f64);

/// Ordered set of options. Keys keep the position they were first set at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<(String, OptionValue)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Builder form of [`OptionSet::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.entries {
            match value {
                OptionValue::Flag(true) => args.push(format!("-{key}")),
                OptionValue::Flag(false) => {}
                OptionValue::Value(v) => {
                    args.push(format!("-{key}"));
                    args.push(v.clone());
                }
            }
        }
        args
    }
}

/// An input file and the options that apply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub options: OptionSet,
    pub path: String,
}

impl InputFile {
    pub fn new(path: impl Into<String>, options: OptionSet) -> Self {
        Self {
            options,
            path: path.into(),
        }
    }

    /// `<options> -i <path>`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.options.to_args();
        args.push("-i".to_string());
        args.push(self.path.clone());
        args
    }
}

/// The output file and the options that apply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub options: OptionSet,
    pub path: String,
}

impl OutputFile {
    pub fn new(path: impl Into<String>, options: OptionSet) -> Self {
        Self {
            options,
            path: path.into(),
        }
    }

    /// `<options> <path>`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.options.to_args();
        args.push(self.path.clone());
        args
    }
}

/// Global options, inputs and an output, composed in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub global: OptionSet,
    pub inputs: Vec<InputFile>,
    pub output: Option<OutputFile>,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(mut self, global: OptionSet) -> Self {
        self.global = global;
        self
    }

    pub fn input(mut self, input: InputFile) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: OutputFile) -> Self {
        self.output = Some(output);
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.global.to_args();
        for input in &self.inputs {
            args.extend(input.to_args());
        }
        if let Some(output) = &self.output {
            args.extend(output.to_args());
        }
        args
    }

    /// Pair the composed arguments with `binary`.
    ///
    /// A lone argument is pre-quoted so the single-string split in
    /// [`crate::escape::escape`] gives back the same word.
    pub fn into_command(self, binary: impl Into<String>) -> Result<Command, EscapeError> {
        let mut args = self.to_args();
        if let [only] = args.as_mut_slice() {
            let quoted = quote(only)?.into_owned();
            *only = quoted;
        }
        Ok(Command::new(binary, args))
    }
}
