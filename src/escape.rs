/// Shell escaping for argument values.
///
/// Two call shapes behave differently on purpose:
/// - a single pre-joined string is word-split with POSIX shell rules first,
///   then every word is quoted on its own;
/// - several values are each quoted as one unit, never split.
use std::borrow::Cow;

/// Errors produced while turning values into shell tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeError {
    /// The single-string form has an unterminated quote or a trailing backslash.
    UnbalancedQuotes { input: String },
    /// The value cannot be represented as a shell token (e.g. it contains NUL).
    Unquotable { input: String, reason: String },
}

impl std::fmt::Display for EscapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscapeError::UnbalancedQuotes { input } => {
                write!(f, "unbalanced quotes in {:?}", input)
            }
            EscapeError::Unquotable { input, reason } => {
                write!(f, "cannot quote {:?}: {}", input, reason)
            }
        }
    }
}

impl std::error::Error for EscapeError {}

/// Escape argument values into a single space-separated, shell-safe string.
pub fn escape<S: AsRef<str>>(args: &[S]) -> Result<String, EscapeError> {
    match args {
        [] => Ok(String::new()),
        [single] => escape_with_split(single.as_ref()),
        many => {
            let quoted = many
                .iter()
                .map(|arg| quote(arg.as_ref()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(quoted.join(" "))
        }
    }
}

/// Word-split `input` like a shell would, then quote each word.
fn escape_with_split(input: &str) -> Result<String, EscapeError> {
    let words = split_command_line(input)?;
    let quoted = words
        .iter()
        .map(|word| quote(word))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join(" "))
}

/// Quote one value as a single shell token.
pub fn quote(value: &str) -> Result<Cow<'_, str>, EscapeError> {
    shlex::try_quote(value).map_err(|e| EscapeError::Unquotable {
        input: value.to_string(),
        reason: e.to_string(),
    })
}

/// Split a finished command line back into its words.
///
/// A `#` starting a word is an ordinary character here, not a comment.
pub fn split_command_line(line: &str) -> Result<Vec<String>, EscapeError> {
    shlex::split(&escape_comment_marks(line)).ok_or_else(|| EscapeError::UnbalancedQuotes {
        input: line.to_string(),
    })
}

/// Backslash every unquoted `#` that starts a word, so `shlex::split` keeps
/// it and the rest of the line.
fn escape_comment_marks(line: &str) -> Cow<'_, str> {
    if !line.contains('#') {
        return Cow::Borrowed(line);
    }

    let mut out = String::with_capacity(line.len() + 4);
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut at_word_start = true;
    for c in line.chars() {
        if escaped {
            escaped = false;
        } else {
            match (quote, c) {
                (Some('\''), '\'') | (Some('"'), '"') => quote = None,
                (Some('"'), '\\') | (None, '\\') => escaped = true,
                (None, '\'' | '"') => quote = Some(c),
                (None, '#') if at_word_start => out.push('\\'),
                _ => {}
            }
        }
        at_word_start = quote.is_none() && !escaped && c.is_whitespace();
        out.push(c);
    }
    Cow::Owned(out)
}
