//! Error taxonomy for the script engine.
//!
//! Low-level parsers (tokenizer, expression engine) report plain `String`
//! messages; the interpreter lifts those into a [`ScriptError`] carrying the
//! offending line so aborts can show the user where they happened.
//!
//! | Variant | Effect on the run |
//! |---------|-------------------|
//! | [`ScriptError::LineAbort`] | ends the script unless an enclosing `Try` catches it |
//! | [`ScriptError::Suspend`] | recoverable pause, the script stays resumable |
//! | [`ScriptError::FatalInternal`] | always ends the script and unwinds everything |
//! | [`ScriptError::Contract`] | host misuse (e.g. completion for an unknown task) |
//!
//! Warnings are not errors: they are logged and execution continues.

use std::fmt;

use thiserror::Error;

/// Convenience alias for results carrying a [`ScriptError`].
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Where in which script an error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRef {
    pub script: String,
    /// 1-based line number, as an editor would show it.
    pub number: usize,
    pub text: String,
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script {} line {}: {}", self.script, self.number, self.text)
    }
}

#[derive(Error, Debug)]
pub enum ScriptError {
    /// Malformed syntax, illegal argument or illegal state for the current line.
    #[error("{message}")]
    LineAbort { message: String, line: Option<LineRef> },

    /// Recoverable pause; the same line is retried after resuming.
    #[error("script suspended because {reason}")]
    Suspend { reason: String },

    /// Stack depth exceeded or corrupted block nesting.
    #[error("internal error: {message}")]
    FatalInternal { message: String, line: Option<LineRef> },

    /// The host broke the scheduler contract.
    #[error("contract violation: {0}")]
    Contract(String),

    /// A script could not be loaded into the library.
    #[error("error loading script {script} line {number}: {message}")]
    Load { script: String, number: usize, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn abort(message: impl Into<String>) -> Self {
        ScriptError::LineAbort { message: message.into(), line: None }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ScriptError::FatalInternal { message: message.into(), line: None }
    }

    /// Attach `line` to a line-level error that does not carry one yet.
    pub fn at_line(self, at: LineRef) -> Self {
        match self {
            ScriptError::LineAbort { message, line: None } => {
                ScriptError::LineAbort { message, line: Some(at) }
            }
            ScriptError::FatalInternal { message, line: None } => {
                ScriptError::FatalInternal { message, line: Some(at) }
            }
            other => other,
        }
    }

    /// The line the error was raised on, if known.
    pub fn line(&self) -> Option<&LineRef> {
        match self {
            ScriptError::LineAbort { line, .. } | ScriptError::FatalInternal { line, .. } => {
                line.as_ref()
            }
            _ => None,
        }
    }

    /// `true` for errors an enclosing `Try` block may catch.
    pub fn is_catchable(&self) -> bool {
        matches!(self, ScriptError::LineAbort { .. })
    }

    /// Multi-line description for the user: the fault plus the offending line.
    pub fn describe(&self) -> String {
        match self.line() {
            Some(at) => format!("{self}\n  at {at}"),
            None => self.to_string(),
        }
    }
}

impl From<toml::de::Error> for ScriptError {
    fn from(e: toml::de::Error) -> Self {
        ScriptError::Config(e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
