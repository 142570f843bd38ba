//! Contract between the interpreter and the host's external operations.
//!
//! An external command is forwarded to [`Operations::invoke`] with its
//! parsed, substituted arguments.  The operation either finishes at once, or
//! starts an asynchronous action identified by a [`TaskToken`] and reports
//! the result later through the scheduler's `complete`.

use std::fmt;

use super::args::Args;
use super::value::Value;

/// Identifies one started asynchronous action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskToken(pub u64);

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Values and an optional one-line log message produced by an operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpReport {
    pub values: Vec<Value>,
    pub log: Option<String>,
}

impl OpReport {
    pub fn values(values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        OpReport { values: values.into_iter().map(Into::into).collect(), log: None }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Immediate result of invoking an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    /// Finished synchronously.
    Done(OpReport),
    /// Started an asynchronous action; the result arrives via `complete`.
    Started(TaskToken),
    /// The resource is busy; dispatch the same line again on the next tick.
    Busy,
    Failed(String),
}

/// Result delivered for a previously started action.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success(OpReport),
    /// Still busy: the line is dispatched again.
    Busy,
    Failed(String),
}

/// Host-side operations reachable from scripts.
pub trait Operations {
    fn invoke(&mut self, name: &str, args: &Args) -> OpOutcome;

    /// Cancel a started action because the script was aborted.
    fn cancel(&mut self, _token: TaskToken) {}
}

/// An operations provider that knows no commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOperations;

impl Operations for NoOperations {
    fn invoke(&mut self, name: &str, _args: &Args) -> OpOutcome {
        OpOutcome::Failed(format!("no handler for {name}"))
    }
}

impl<T: Operations + ?Sized> Operations for Box<T> {
    fn invoke(&mut self, name: &str, args: &Args) -> OpOutcome {
        (**self).invoke(name, args)
    }

    fn cancel(&mut self, token: TaskToken) {
        (**self).cancel(token)
    }
}
