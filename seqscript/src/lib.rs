//! seqscript: a line-oriented automation scripting engine.
//!
//! Scripts drive long sequences of instrument operations.  The
//! [`script::Interpreter`] executes one line at a time and the
//! [`script::Scheduler`] suspends the run whenever a line starts an
//! asynchronous action, resuming at exactly the next line once the host
//! reports the action complete.
//!
//! ```rust
//! use seqscript::config::EngineConfig;
//! use seqscript::script::{CommandTable, NoOperations, ScriptLibrary, Scheduler, TickOutcome};
//!
//! let mut lib = ScriptLibrary::new();
//! lib.load_source("demo", "x = 6 * 7\nEcho answer $x").unwrap();
//! let mut s = Scheduler::new(lib, CommandTable::builtin(), NoOperations, EngineConfig::default());
//! s.start("demo").unwrap();
//! assert_eq!(s.tick(), TickOutcome::Finished);
//! assert_eq!(s.take_output(), vec!["answer 42"]);
//! ```

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod script;
pub mod sim;

pub use error::{ScriptError, ScriptResult};
