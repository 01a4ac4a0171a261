//! Shell-style command splitting and quoting.
//!
//! Commands that already target the bridge program arrive as a single string
//! and must be turned into an argument vector without handing them to a real
//! shell, which would interpret them a second time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::borrow::Cow;

/// Errors produced while splitting a command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// Input ended right after a backslash.
    #[error("unterminated escape sequence in command: {0}")]
    UnterminatedEscape(String),

    /// A single or double quote was never closed.
    #[error("unterminated quote in command: {0}")]
    UnterminatedQuote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Splits `input` into arguments the way a POSIX shell would tokenize words.
///
/// - Unquoted whitespace separates arguments.
/// - Single quotes preserve everything literally, backslashes included.
/// - Double quotes preserve whitespace; a backslash escapes the next character.
/// - A bare backslash outside quotes escapes the next character.
///
/// Empty words are dropped, so `''` and `""` on their own yield no argument.
pub fn split(input: &str) -> Result<Vec<String>, SplitError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote = Quote::None;
    let mut escape = false;

    for c in input.chars() {
        if escape {
            current.push(c);
            escape = false;
            continue;
        }

        match (quote, c) {
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::Single, _) => current.push(c),
            (Quote::Double | Quote::None, '\\') => escape = true,
            (Quote::Double, _) => current.push(c),
            (Quote::None, '\'') => quote = Quote::Single,
            (Quote::None, '"') => quote = Quote::Double,
            (Quote::None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (Quote::None, _) => current.push(c),
        }
    }

    if escape {
        return Err(SplitError::UnterminatedEscape(input.to_string()));
    }
    if quote != Quote::None {
        return Err(SplitError::UnterminatedQuote(input.to_string()));
    }
    if !current.is_empty() {
        args.push(current);
    }

    Ok(args)
}

/// Quotes a single argument for safe interpolation into a `bash -c` string.
pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_words::quote(arg)
}

/// Builds a single-line command that replays `script` through `bash -s`.
///
/// The script travels base64-encoded so embedded newlines never reach the
/// line-framed harness channel.
pub fn script_command(script: &str) -> String {
    let encoded = STANDARD.encode(script.as_bytes());
    format!("printf %s '{encoded}' | base64 -d | bash -s")
}
