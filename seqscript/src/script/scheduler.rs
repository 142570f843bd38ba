//! Suspension scheduler.
//!
//! [`Scheduler`] drives an [`Interpreter`] from the host's idle loop.  Each
//! [`Scheduler::tick`] dispatches lines until one of them hands control back:
//! an asynchronous action was started, a delay or pause began, a resource
//! was busy, or the fast-path iteration bound or time budget ran out.  The
//! host reports finished actions through [`Scheduler::complete`], which
//! re-enters the dispatch loop at exactly the line after the one that
//! started the action (or the same line again if the resource was busy).
//!
//! ```text
//!  Idle ──start──▶ Dispatching ──fast──▶ CompletedFast ──▶ Dispatching …
//!                      │  │  └──started / delay──▶ WaitingOnTask ──complete──▶ Dispatching
//!                      │  └──pause / busy / limit──▶ Suspended ──resume / retry──▶ Dispatching
//!                      └──abort (any state)──▶ Aborted
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::bridge::{BridgeResponse, BridgeServer, PendingCall};
use crate::config::{EngineConfig, RunLimits};
use crate::error::{ScriptError, ScriptResult};

use super::{
    commands::CommandTable,
    interp::{Interpreter, Step},
    library::ScriptLibrary,
    ops::{Operations, TaskResult, TaskToken},
    value::Value,
    vars::{VariableStore, REPORT_PREFIXES},
};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    /// No script running.
    Idle,
    /// Ready to execute the line at the cursor.
    Dispatching,
    /// The last line finished synchronously inside the fast path.
    CompletedFast,
    /// Waiting for a started action or a delay to finish.
    WaitingOnTask,
    /// Paused.  With `retry` set the same line is dispatched again on the
    /// next tick; otherwise the host must call [`Scheduler::resume`].
    Suspended { reason: String, retry: bool },
    /// The last run was aborted; start a new one to continue.
    Aborted,
}

/// Who is waiting on a [`PendingTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    Script,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    External(TaskToken),
    Timer { until: Instant },
}

/// The one outstanding action the scheduler is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTask {
    pub kind: PendingKind,
    pub origin: TaskOrigin,
}

/// What a call to `tick`, `complete` or `resume` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do.
    Idle,
    /// The fast path ran out; more lines are ready for the next tick.
    Yielded,
    /// Waiting on a [`PendingTask`].
    Waiting,
    Suspended(String),
    Finished,
    Aborted(String),
}

/// How the most recent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSummary {
    NeverRun,
    Running,
    Finished,
    /// The fault message and the offending line.
    Aborted(String),
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler<O: Operations> {
    interp: Interpreter,
    ops: O,
    config: EngineConfig,
    state: SchedulerState,
    pending: Option<PendingTask>,
    last_run: RunSummary,
    cancel: Arc<AtomicBool>,
    bridge: Option<BridgeServer>,
    /// Bridge request being serviced.
    bridge_call: Option<PendingCall>,
    /// Start of the current limit window.
    window_start: Instant,
    window_dispatches: u64,
    window_errors: usize,
}

impl<O: Operations> std::fmt::Debug for Scheduler<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("last_run", &self.last_run)
            .finish_non_exhaustive()
    }
}

impl<O: Operations> Scheduler<O> {
    pub fn new(library: ScriptLibrary, table: CommandTable, ops: O, config: EngineConfig) -> Self {
        Scheduler {
            interp: Interpreter::new(library, table, &config),
            ops,
            config,
            state: SchedulerState::Idle,
            pending: None,
            last_run: RunSummary::NeverRun,
            cancel: Arc::new(AtomicBool::new(false)),
            bridge: None,
            bridge_call: None,
            window_start: Instant::now(),
            window_dispatches: 0,
            window_errors: 0,
        }
    }

    pub fn attach_bridge(&mut self, server: BridgeServer) {
        self.bridge = Some(server);
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PendingTask> {
        self.pending.as_ref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.last_run
    }

    /// A flag the host may set from anywhere to abort the running script.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.interp.take_output()
    }

    pub fn variables(&self) -> &VariableStore {
        self.interp.variables()
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interp
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    /// `true` while a script run is in progress (including waiting and suspended).
    pub fn is_running(&self) -> bool {
        !matches!(self.state, SchedulerState::Idle | SchedulerState::Aborted)
    }

    // ── Run control ───────────────────────────────────────────────────────────

    /// Start script `name`; the first line runs on the next tick.
    pub fn start(&mut self, name: &str) -> ScriptResult<()> {
        if self.is_running() || self.pending.is_some() {
            return Err(ScriptError::Contract("a script or bridge command is already running".into()));
        }
        self.interp.start(name)?;
        self.cancel.store(false, Ordering::SeqCst);
        self.open_window();
        self.state = SchedulerState::Dispatching;
        self.last_run = RunSummary::Running;
        Ok(())
    }

    /// Continue a script suspended by `Pause` or a run limit.
    pub fn resume(&mut self) -> ScriptResult<TickOutcome> {
        if !matches!(self.state, SchedulerState::Suspended { .. }) {
            return Err(ScriptError::Contract(format!("resume while {:?}", self.state)));
        }
        info!("script resumed");
        self.open_window();
        self.state = SchedulerState::Dispatching;
        Ok(self.run_lines())
    }

    /// Abort the running script, if any.
    pub fn abort(&mut self, reason: &str) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Idle;
        }
        self.abort_with(ScriptError::abort(reason))
    }

    fn open_window(&mut self) {
        self.window_start = Instant::now();
        self.window_dispatches = 0;
        self.window_errors = self.interp.errors_caught;
    }

    // ── Ticks ─────────────────────────────────────────────────────────────────

    /// Give the scheduler a slice of the host's idle time.
    pub fn tick(&mut self) -> TickOutcome {
        if self.cancel.swap(false, Ordering::SeqCst) && self.is_running() {
            return self.abort_with(ScriptError::abort("script cancelled"));
        }
        match self.state.clone() {
            SchedulerState::Idle | SchedulerState::Aborted => self.service_bridge(),
            SchedulerState::Dispatching | SchedulerState::CompletedFast => self.run_lines(),
            SchedulerState::Suspended { retry: true, .. } => {
                self.state = SchedulerState::Dispatching;
                self.run_lines()
            }
            SchedulerState::Suspended { reason, retry: false } => TickOutcome::Suspended(reason),
            SchedulerState::WaitingOnTask => match self.pending {
                Some(PendingTask { kind: PendingKind::Timer { until }, origin }) if Instant::now() >= until => {
                    self.pending = None;
                    match origin {
                        TaskOrigin::Script => {
                            self.state = SchedulerState::Dispatching;
                            self.run_lines()
                        }
                        TaskOrigin::Bridge => self.finish_bridge(Ok(())),
                    }
                }
                _ => TickOutcome::Waiting,
            },
        }
    }

    /// Deliver the result of the action identified by `token`.
    pub fn complete(&mut self, token: TaskToken, result: TaskResult) -> ScriptResult<TickOutcome> {
        let origin = match self.pending {
            Some(PendingTask { kind: PendingKind::External(t), origin }) if t == token => origin,
            _ => {
                warn!(%token, "completion for a task that is not pending");
                return Err(ScriptError::Contract(format!("{token} is not the pending task")));
            }
        };
        self.pending = None;

        if origin == TaskOrigin::Bridge {
            return Ok(match result {
                TaskResult::Success(report) => {
                    self.interp.apply_report(report);
                    self.finish_bridge(Ok(()))
                }
                TaskResult::Busy => {
                    self.state = SchedulerState::Idle;
                    TickOutcome::Idle
                }
                TaskResult::Failed(msg) => self.finish_bridge(Err(msg)),
            });
        }

        if self.cancel.swap(false, Ordering::SeqCst) {
            return Ok(self.abort_with(ScriptError::abort("script cancelled")));
        }
        Ok(match result {
            TaskResult::Success(report) => {
                self.interp.apply_report(report);
                self.state = SchedulerState::Dispatching;
                self.run_lines()
            }
            TaskResult::Busy => {
                self.interp.rewind();
                self.suspend("resource busy".into(), true)
            }
            TaskResult::Failed(msg) => match self.interp.raise(ScriptError::abort(msg)) {
                Ok(()) => {
                    self.state = SchedulerState::Dispatching;
                    self.run_lines()
                }
                Err(e) => self.abort_with(e),
            },
        })
    }

    /// Dispatch lines until one yields, the fast path ends, or the run stops.
    fn run_lines(&mut self) -> TickOutcome {
        let started = Instant::now();
        let budget = self.config.fast_path_budget();
        let mut iterations = 0;
        loop {
            if self.cancel.swap(false, Ordering::SeqCst) {
                return self.abort_with(ScriptError::abort("script cancelled"));
            }
            if let Some(reason) = self.limit_reached() {
                return self.suspend(reason, false);
            }
            self.state = SchedulerState::Dispatching;
            self.window_dispatches += 1;
            iterations += 1;

            match self.interp.step(&mut self.ops) {
                Ok(Step::Continue { no_yield }) => {
                    self.state = SchedulerState::CompletedFast;
                    if !no_yield || iterations >= self.config.fast_path_iterations || started.elapsed() >= budget {
                        self.state = SchedulerState::Dispatching;
                        return TickOutcome::Yielded;
                    }
                }
                Ok(Step::Started(token)) => {
                    return self.wait_on(PendingKind::External(token), TaskOrigin::Script);
                }
                Ok(Step::Wait(d)) => {
                    return self.wait_on(PendingKind::Timer { until: Instant::now() + d }, TaskOrigin::Script);
                }
                Ok(Step::Busy) => return self.suspend("resource busy".into(), true),
                Ok(Step::Pause(msg)) => return self.suspend(msg, false),
                Ok(Step::Finished) => return self.finish(),
                Err(e) => return self.abort_with(e),
            }
        }
    }

    /// The first run limit reached in the current window, as a reason.
    fn limit_reached(&self) -> Option<String> {
        let RunLimits { max_run_seconds, max_dispatches, max_errors } = &self.config.limits;
        if let Some(secs) = max_run_seconds {
            if self.window_start.elapsed() >= Duration::from_secs_f64(*secs) {
                return Some(format!("it has run for more than {secs} seconds"));
            }
        }
        if let Some(n) = max_dispatches {
            if self.window_dispatches >= *n {
                return Some(format!("it has executed {n} lines"));
            }
        }
        if let Some(n) = max_errors {
            if self.interp.errors_caught - self.window_errors >= *n {
                return Some(format!("{n} errors were caught"));
            }
        }
        None
    }

    fn wait_on(&mut self, kind: PendingKind, origin: TaskOrigin) -> TickOutcome {
        self.pending = Some(PendingTask { kind, origin });
        self.state = SchedulerState::WaitingOnTask;
        TickOutcome::Waiting
    }

    fn suspend(&mut self, reason: String, retry: bool) -> TickOutcome {
        if !retry {
            let msg = ScriptError::Suspend { reason: reason.clone() }.to_string();
            info!("{msg}");
            self.interp.output.push(msg);
        }
        self.state = SchedulerState::Suspended { reason: reason.clone(), retry };
        TickOutcome::Suspended(reason)
    }

    fn finish(&mut self) -> TickOutcome {
        self.interp.end_run(false);
        self.state = SchedulerState::Idle;
        self.last_run = RunSummary::Finished;
        info!("script finished");
        TickOutcome::Finished
    }

    fn abort_with(&mut self, err: ScriptError) -> TickOutcome {
        if let Some(PendingTask { kind: PendingKind::External(token), .. }) = self.pending.take() {
            self.ops.cancel(token);
        }
        if let Some(call) = self.bridge_call.take() {
            call.respond(BridgeResponse::failure(err.to_string()));
        }
        self.interp.end_run(true);
        let message = err.describe();
        error!("script aborted: {message}");
        self.interp.output.push(message.clone());
        self.state = SchedulerState::Aborted;
        self.last_run = RunSummary::Aborted(message.clone());
        TickOutcome::Aborted(message)
    }

    // ── Bridge ────────────────────────────────────────────────────────────────

    /// Run one queued bridge request as a line of text.
    fn service_bridge(&mut self) -> TickOutcome {
        if self.bridge_call.is_none() {
            self.bridge_call = self.bridge.as_ref().and_then(BridgeServer::try_next);
        }
        let Some(call) = &self.bridge_call else {
            return TickOutcome::Idle;
        };
        let line = call.request.line();
        self.interp.variables_mut().clear(super::vars::Scope::Report);
        match self.interp.dispatch_text(&line, &mut self.ops) {
            Ok(Step::Continue { .. } | Step::Finished) => self.finish_bridge(Ok(())),
            Ok(Step::Started(token)) => self.wait_on(PendingKind::External(token), TaskOrigin::Bridge),
            Ok(Step::Wait(d)) => self.wait_on(PendingKind::Timer { until: Instant::now() + d }, TaskOrigin::Bridge),
            // Kept for the next tick.
            Ok(Step::Busy) => TickOutcome::Idle,
            Ok(Step::Pause(_)) => self.finish_bridge(Err("Pause cannot be used outside a script".into())),
            Err(e) => self.finish_bridge(Err(e.to_string())),
        }
    }

    fn finish_bridge(&mut self, result: Result<(), String>) -> TickOutcome {
        self.state = SchedulerState::Idle;
        if let Some(call) = self.bridge_call.take() {
            let response = match result {
                Ok(()) => BridgeResponse::success(report_values(self.interp.variables())),
                Err(msg) => BridgeResponse::failure(msg),
            };
            call.respond(response);
        }
        TickOutcome::Idle
    }
}

/// Current report values in order.
fn report_values(vars: &VariableStore) -> Vec<Value> {
    (1..)
        .map_while(|i| vars.lookup(&format!("{}{i}", REPORT_PREFIXES[0])))
        .map(|v| v.as_value())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
