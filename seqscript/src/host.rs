//! Async host idle loop.
//!
//! ```text
//!   ┌──────────────────────────────┐
//!   │  HostLoop::run()             │
//!   │  tokio::select! over:        │
//!   │  • completions ◄─────────────┼── tasks started by Operations
//!   │  • idle tick interval        │
//!   └──────────────┬───────────────┘
//!                  ▼
//!             Scheduler::tick / complete
//! ```
//!
//! The cancellation flag from [`Scheduler::cancel_handle`] is honoured on
//! the next tick or completion.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::script::ops::{Operations, TaskResult, TaskToken};
use crate::script::scheduler::{RunSummary, Scheduler, SchedulerState, TickOutcome};

/// A finished asynchronous action, sent by whoever performed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub token: TaskToken,
    pub result: TaskResult,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// What to do when a script pauses itself or reaches a run limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PausePolicy {
    /// Return from [`HostLoop::run`], leaving the script resumable.
    #[default]
    Return,
    /// Resume at once.
    Resume,
}

pub struct HostLoop<O: Operations> {
    scheduler: Scheduler<O>,
    completions: CompletionReceiver,
    tick: Duration,
    on_pause: PausePolicy,
}

impl<O: Operations> HostLoop<O> {
    pub fn new(scheduler: Scheduler<O>, completions: CompletionReceiver, tick: Duration) -> Self {
        HostLoop { scheduler, completions, tick, on_pause: PausePolicy::Return }
    }

    pub fn with_pause_policy(mut self, policy: PausePolicy) -> Self {
        self.on_pause = policy;
        self
    }

    pub fn scheduler(&self) -> &Scheduler<O> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<O> {
        &mut self.scheduler
    }

    pub fn into_scheduler(self) -> Scheduler<O> {
        self.scheduler
    }

    /// Drive the running script until it finishes, aborts or pauses.
    /// Script output is passed to `sink` as it is produced.
    pub async fn run(&mut self, mut sink: impl FnMut(&str)) -> RunSummary {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                Some(c) = self.completions.recv() => {
                    debug!(token = %c.token, "completion");
                    match self.scheduler.complete(c.token, c.result) {
                        Ok(o) => o,
                        Err(e) => {
                            // Late completions of cancelled tasks land here.
                            warn!("{e}");
                            continue;
                        }
                    }
                }
                _ = interval.tick() => self.scheduler.tick(),
            };
            for line in self.scheduler.take_output() {
                sink(&line);
            }

            match outcome {
                TickOutcome::Finished | TickOutcome::Aborted(_) => break,
                TickOutcome::Suspended(_) => {
                    if matches!(self.scheduler.state(), SchedulerState::Suspended { retry: false, .. }) {
                        match self.on_pause {
                            PausePolicy::Return => break,
                            PausePolicy::Resume => {
                                if let Err(e) = self.scheduler.resume() {
                                    warn!("{e}");
                                }
                                for line in self.scheduler.take_output() {
                                    sink(&line);
                                }
                                if !self.scheduler.is_running() {
                                    break;
                                }
                            }
                        }
                    }
                }
                TickOutcome::Idle if !self.scheduler.is_running() => break,
                _ => {}
            }
        }
        match self.scheduler.state() {
            SchedulerState::Suspended { .. } => RunSummary::Running,
            _ => self.scheduler.summary().clone(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
