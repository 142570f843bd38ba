//! Simulated instrument.
//!
//! A small stand-in for real hardware so scripts can be run end to end:
//! a stage that takes time to move, a camera whose captures take the
//! exposure time, a beam shift setting, and a readiness check that reports
//! busy while the stage settles.  Moves and captures run as tokio tasks and
//! report back through a [`CompletionSender`], so [`SimulatedInstrument`]
//! must be driven from inside a tokio runtime.
//!
//! | Command | Args | Kind |
//! |---------|------|------|
//! | `MoveStageTo x y [z]` | absolute position | asynchronous |
//! | `MoveStage dx dy` | relative move | asynchronous |
//! | `ReportStagePos` | | reports x y z |
//! | `Capture [seconds]` | exposure, default 0.05 | asynchronous, reports image number and mean |
//! | `SetBeamShift x y` | | immediate |
//! | `ReportBeamShift` | | reports x y |
//! | `WaitUntilReady` | | busy until the stage has settled |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::host::{Completion, CompletionSender};
use crate::script::{
    args::Args,
    commands::{CommandFlags, CommandTableBuilder},
    ops::{OpOutcome, OpReport, Operations, TaskResult, TaskToken},
};

const STAGE_LIMIT: f64 = 1000.0;
const DEFAULT_EXPOSURE: f64 = 0.05;

/// (name, min args, flags)
const COMMANDS: &[(&str, u8, CommandFlags)] = &[
    ("MoveStageTo", 2, CommandFlags::ARITH),
    ("MoveStage", 2, CommandFlags::ARITH),
    ("ReportStagePos", 0, CommandFlags::NO_YIELD),
    ("Capture", 0, CommandFlags::ARITH),
    ("SetBeamShift", 2, CommandFlags::ARITH.union(CommandFlags::NO_YIELD)),
    ("ReportBeamShift", 0, CommandFlags::NO_YIELD),
    ("WaitUntilReady", 0, CommandFlags::NONE),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    /// Stage speed in units per second.
    pub stage_speed: f64,
    /// Time after a move during which `WaitUntilReady` reports busy.
    pub settle: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        SimSettings { stage_speed: 2000.0, settle: Duration::from_millis(20) }
    }
}

#[derive(Debug, Default)]
struct SimState {
    stage: [f64; 3],
    beam_shift: [f64; 2],
    images: u64,
    settled_at: Option<Instant>,
}

pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
    settings: SimSettings,
    completions: CompletionSender,
    tasks: HashMap<TaskToken, JoinHandle<()>>,
    next_token: u64,
}

impl std::fmt::Debug for SimulatedInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedInstrument")
            .field("settings", &self.settings)
            .field("running_tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedInstrument {
    pub fn new(completions: CompletionSender) -> Self {
        Self::with_settings(completions, SimSettings::default())
    }

    pub fn with_settings(completions: CompletionSender, settings: SimSettings) -> Self {
        SimulatedInstrument {
            state: Arc::new(Mutex::new(SimState::default())),
            settings,
            completions,
            tasks: HashMap::new(),
            next_token: 0,
        }
    }

    /// Add the simulator's commands to a command table.
    pub fn register(builder: &mut CommandTableBuilder) -> Result<(), String> {
        for &(name, min_args, flags) in COMMANDS {
            builder.external(name, min_args, flags)?;
        }
        Ok(())
    }

    pub fn stage_position(&self) -> [f64; 3] {
        self.lock().stage
    }

    pub fn image_count(&self) -> u64 {
        self.lock().images
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `finish` after `delay` on the runtime and report its result.
    fn start_task(
        &mut self,
        delay: Duration,
        finish: impl FnOnce(&mut SimState) -> TaskResult + Send + 'static,
    ) -> OpOutcome {
        self.tasks.retain(|_, h| !h.is_finished());
        self.next_token += 1;
        let token = TaskToken(self.next_token);
        let state = Arc::clone(&self.state);
        let tx = self.completions.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = {
                let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
                finish(&mut s)
            };
            let _ = tx.send(Completion { token, result });
        });
        self.tasks.insert(token, handle);
        debug!(%token, ?delay, "simulated action started");
        OpOutcome::Started(token)
    }

    fn move_to(&mut self, target: [f64; 3]) -> OpOutcome {
        let from = self.lock().stage;
        let distance = from.iter().zip(&target).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt();
        let secs = (distance / self.settings.stage_speed).max(0.001);
        let settle = self.settings.settle;
        self.start_task(Duration::from_secs_f64(secs), move |s| {
            if target[..2].iter().any(|v| v.abs() > STAGE_LIMIT) {
                return TaskResult::Failed(format!(
                    "stage move to {} {} is outside the limits of +/-{STAGE_LIMIT}",
                    target[0], target[1]
                ));
            }
            s.stage = target;
            s.settled_at = Some(Instant::now() + settle);
            TaskResult::Success(OpReport::values(target))
        })
    }
}

impl Operations for SimulatedInstrument {
    fn invoke(&mut self, name: &str, args: &Args) -> OpOutcome {
        for i in 0..args.len() {
            if !args.is_number(i) {
                return OpOutcome::Failed(format!("{name}: argument '{}' is not a number", args.str(i)));
            }
        }
        match name {
            "MoveStageTo" => {
                let z = if args.is_empty(2) { self.lock().stage[2] } else { args.float(2) };
                self.move_to([args.float(0), args.float(1), z])
            }
            "MoveStage" => {
                let [x, y, z] = self.lock().stage;
                self.move_to([x + args.float(0), y + args.float(1), z])
            }
            "ReportStagePos" => {
                let [x, y, z] = self.lock().stage;
                OpOutcome::Done(OpReport::values([x, y, z]).with_log(format!("Stage at {x} {y} {z}")))
            }
            "Capture" => {
                let exposure = if args.is_empty(0) { DEFAULT_EXPOSURE } else { args.float(0) };
                if exposure <= 0.0 {
                    return OpOutcome::Failed(format!("Capture: exposure must be positive, not {exposure}"));
                }
                self.start_task(Duration::from_secs_f64(exposure), move |s| {
                    s.images += 1;
                    let mean = 100.0 * exposure + s.images as f64;
                    TaskResult::Success(OpReport::values([s.images as f64, mean]))
                })
            }
            "SetBeamShift" => {
                self.lock().beam_shift = [args.float(0), args.float(1)];
                OpOutcome::Done(OpReport::default())
            }
            "ReportBeamShift" => OpOutcome::Done(OpReport::values(self.lock().beam_shift)),
            "WaitUntilReady" => match self.lock().settled_at {
                Some(t) if Instant::now() < t => OpOutcome::Busy,
                _ => OpOutcome::Done(OpReport::default()),
            },
            _ => OpOutcome::Failed(format!("the simulator has no command {name}")),
        }
    }

    fn cancel(&mut self, token: TaskToken) {
        if let Some(handle) = self.tasks.remove(&token) {
            handle.abort();
            debug!(%token, "simulated action cancelled");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
