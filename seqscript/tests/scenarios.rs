use std::time::Duration;

use seqscript::config::EngineConfig;
use seqscript::host::{completion_channel, HostLoop};
use seqscript::script::args::Args;
use seqscript::script::{
    CommandFlags, CommandTable, CommandTableBuilder, NoOperations, OpOutcome, OpReport, Operations, RunSummary,
    Scheduler, SchedulerState, Scope, ScriptLibrary, TaskResult, TaskToken, TickOutcome, Value,
};
use seqscript::sim::SimulatedInstrument;
use seqscript::ScriptError;

fn library(src: &str) -> ScriptLibrary {
    let mut lib = ScriptLibrary::new();
    lib.load_source("main", src).unwrap();
    lib
}

/// Run a script that needs no external operations; returns output and summary.
fn run_plain(src: &str) -> (Vec<String>, RunSummary) {
    let mut s = Scheduler::new(library(src), CommandTable::builtin(), NoOperations, EngineConfig::default());
    s.start("main").unwrap();
    let mut out = Vec::new();
    for _ in 0..1000 {
        let outcome = s.tick();
        out.extend(s.take_output());
        if matches!(outcome, TickOutcome::Finished | TickOutcome::Aborted(_)) {
            return (out, s.summary().clone());
        }
    }
    panic!("script did not finish");
}

#[test]
fn loop_logs_three_lines() {
    let (out, summary) = run_plain("LOOP 3\n ECHO hi\nENDLOOP");
    assert_eq!(out, vec!["hi", "hi", "hi"]);
    assert_eq!(summary, RunSummary::Finished);
}

#[test]
fn if_else_takes_true_branch() {
    let (out, _) = run_plain("X = 5\nIF X > 3\n ECHO big\nELSE\n ECHO small\nENDIF");
    assert_eq!(out, vec!["big"]);
}

#[test]
fn throw_is_caught_without_aborting() {
    let (out, summary) = run_plain("TRY\n THROW oops\nCATCH\n ECHO caught\nENDTRY");
    assert_eq!(out, vec!["caught"]);
    assert_eq!(summary, RunSummary::Finished);
}

#[test]
fn recursive_function_call_aborts() {
    let (out, summary) = run_plain("CallFunction Walk 1\nFunction Walk 1 0 n\n CallFunction Walk ($n + 1)\nEndFunction");
    let RunSummary::Aborted(msg) = summary else { panic!("expected abort, got {summary:?}") };
    assert!(msg.contains("re-entrant call to function Walk"), "{msg}");
    assert!(msg.contains("CallFunction Walk ($n + 1)"), "{msg}");
    assert_eq!(out.last(), Some(&msg));
}

/// `Expose` starts an action on every dispatch and counts dispatches.
#[derive(Default)]
struct CountingOps {
    dispatches: u32,
}

impl Operations for CountingOps {
    fn invoke(&mut self, _name: &str, _args: &Args) -> OpOutcome {
        self.dispatches += 1;
        OpOutcome::Started(TaskToken(u64::from(self.dispatches)))
    }
}

#[test]
fn busy_completions_redispatch_the_same_line() {
    let mut b = CommandTableBuilder::new();
    b.external("Expose", 0, CommandFlags::NONE).unwrap();
    let mut s = Scheduler::new(library("Expose\nEcho next"), b.build(), CountingOps::default(), EngineConfig::default());
    s.start("main").unwrap();

    assert_eq!(s.tick(), TickOutcome::Waiting);
    assert!(matches!(s.complete(TaskToken(1), TaskResult::Busy).unwrap(), TickOutcome::Suspended(_)));
    assert_eq!(s.tick(), TickOutcome::Waiting);
    assert!(matches!(s.complete(TaskToken(2), TaskResult::Busy).unwrap(), TickOutcome::Suspended(_)));
    assert_eq!(s.tick(), TickOutcome::Waiting);
    assert!(s.take_output().is_empty());
    let done = s.complete(TaskToken(3), TaskResult::Success(OpReport::default())).unwrap();
    assert_eq!(done, TickOutcome::Finished);
    assert_eq!(s.ops().dispatches, 3);
    assert_eq!(s.take_output(), vec!["next"]);
}

#[test]
fn no_dispatch_while_task_pending() {
    let mut b = CommandTableBuilder::new();
    b.external("Expose", 0, CommandFlags::NONE).unwrap();
    let mut s = Scheduler::new(library("Expose\nExpose"), b.build(), CountingOps::default(), EngineConfig::default());
    s.start("main").unwrap();
    s.tick();
    for _ in 0..5 {
        assert_eq!(s.tick(), TickOutcome::Waiting);
    }
    assert_eq!(s.ops().dispatches, 1);
    assert_eq!(s.state(), &SchedulerState::WaitingOnTask);
    assert!(matches!(s.start("main"), Err(ScriptError::Contract(_))));
}

#[test]
fn multi_script_file_with_calls() {
    let src = "\
# acquisition plan
Script Main
  Loop 2 n
    CallScript Tile
  EndLoop
  Echo tiles $total
Script Tile
  total = $total + 1
";
    let mut lib = ScriptLibrary::new();
    lib.load_source("plan", src).unwrap();
    let mut s = Scheduler::new(lib, CommandTable::builtin(), NoOperations, EngineConfig::default());
    s.start("Main").unwrap();
    s.interpreter_mut().variables_mut().set("total", &Value::Int(10), Scope::Regular).unwrap();
    while !matches!(s.tick(), TickOutcome::Finished | TickOutcome::Aborted(_)) {}
    assert_eq!(s.take_output(), vec!["tiles 12"]);
}

#[tokio::test]
async fn tilt_series_against_simulator() {
    let src = "\
DoLoop a -10 10 10
  CallFunction Acquire $a
EndLoop
ReportStagePos
Echo stage x $repVal1

Function Acquire 1 0 angle
  MoveStageTo ($angle * 2) 0
  WaitUntilReady
  Capture 0.01
  Echo image $repVal1 at $angle
EndFunction
";
    let (tx, rx) = completion_channel();
    let mut b = CommandTableBuilder::new();
    SimulatedInstrument::register(&mut b).unwrap();
    let mut lib = ScriptLibrary::new();
    lib.load_source("tilt", src).unwrap();
    let mut s = Scheduler::new(lib, b.build(), SimulatedInstrument::new(tx), EngineConfig::default());
    s.start("tilt").unwrap();
    let mut host = HostLoop::new(s, rx, Duration::from_millis(1));
    let mut out = Vec::new();
    let summary = host.run(|l| out.push(l.to_owned())).await;
    assert_eq!(summary, RunSummary::Finished, "{out:?}");
    assert_eq!(out.iter().filter(|l| l.starts_with("image")).count(), 3);
    assert_eq!(out[0], "image 1 at -10");
    assert!(out.contains(&"Stage at 20 0 0".to_owned()), "{out:?}");
    assert_eq!(out.last().map(String::as_str), Some("stage x 20"));
    assert_eq!(host.scheduler().ops().image_count(), 3);
}

#[tokio::test]
async fn simulator_failure_caught_by_try() {
    let src = "\
Try
  MoveStageTo 5000 0
  Echo moved
Catch
  Echo recovered: $repVal1
EndTry
";
    let (tx, rx) = completion_channel();
    let mut b = CommandTableBuilder::new();
    SimulatedInstrument::register(&mut b).unwrap();
    let mut s = Scheduler::new(library(src), b.build(), SimulatedInstrument::new(tx), EngineConfig::default());
    s.start("main").unwrap();
    let mut host = HostLoop::new(s, rx, Duration::from_millis(1));
    let mut out = Vec::new();
    assert_eq!(host.run(|l| out.push(l.to_owned())).await, RunSummary::Finished);
    assert_eq!(out.len(), 1);
    assert!(out[0].starts_with("recovered: stage move to 5000 0"), "{out:?}");
}
