/// Command line composition: escaped binary + escaped arguments, optionally
/// wrapped so the whole line runs at a different scheduling priority.
use crate::escape::{escape, quote, EscapeError};

/// A binary and its argument values, as handed to the runner.
///
/// A single argument is treated as a pre-joined string and word-split;
/// several arguments are each kept as one word. See [`crate::escape::escape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    binary: String,
    args: Vec<String>,
}

impl Command {
    pub fn new<B, I, S>(binary: B, args: I) -> Self
    where
        B: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary: binary.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Build the command line without any priority wrapper.
pub fn build_command_without_options(command: &Command) -> Result<String, EscapeError> {
    let binary = quote(command.binary())?;
    let args = escape(command.args())?;
    if args.is_empty() {
        Ok(binary.into_owned())
    } else {
        Ok(format!("{} {}", binary, args))
    }
}

/// Build the final command line.
///
/// With `nice == 0` this is the plain line. Otherwise the whole line is passed
/// as one quoted script to `sh -c` under `nice -n <nice>`, so the adjustment
/// covers every process the line starts.
pub fn build_command(command: &Command, nice: i32) -> Result<String, EscapeError> {
    let line = build_command_without_options(command)?;
    if nice == 0 {
        return Ok(line);
    }
    Ok(format!("nice -n {} sh -c {}", nice, quote(&line)?))
}
