//! The script engine.
//!
//! - [`reader`]: script buffers, comment stripping, tokenizer, line forms
//! - [`value`], [`vars`]: dynamically typed values and the variable store
//! - [`expr`], [`functions`], [`subst`]: expressions, built-in functions
//!   and `$variable` substitution
//! - [`commands`], [`args`], [`builtins`]: the command table and handlers
//! - [`flow`], [`frames`], [`library`]: block and call stacks, loaded scripts
//! - [`interp`]: executes one line per step
//! - [`scheduler`]: suspends and resumes runs around asynchronous actions
//! - [`ops`]: the contract with the host's external operations

pub mod args;
pub mod builtins;
pub mod commands;
pub mod expr;
pub mod flow;
pub mod frames;
pub mod functions;
pub mod interp;
pub mod library;
pub mod ops;
pub mod reader;
pub mod scheduler;
pub mod subst;
pub mod value;
pub mod vars;

// Re-exports for convenience.
pub use commands::{CommandFlags, CommandTable, CommandTableBuilder};
pub use expr::EvalContext;
pub use interp::{Interpreter, Step};
pub use library::ScriptLibrary;
pub use ops::{NoOperations, OpOutcome, OpReport, Operations, TaskResult, TaskToken};
pub use scheduler::{PendingKind, PendingTask, RunSummary, Scheduler, SchedulerState, TickOutcome};
pub use value::Value;
pub use vars::Scope;
