use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use seqscript::cli::Cli;
use seqscript::config::EngineConfig;
use seqscript::host::{completion_channel, HostLoop, PausePolicy};
use seqscript::script::{CommandTableBuilder, RunSummary, Scheduler, ScriptLibrary, Scope};
use seqscript::sim::SimulatedInstrument;
use seqscript::ScriptResult;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli).await {
        Ok(RunSummary::Finished) => ExitCode::SUCCESS,
        Ok(RunSummary::Aborted(_)) => ExitCode::from(1),
        Ok(_) => {
            eprintln!("seqscript: script suspended; rerun with --auto-resume to continue past pauses");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("seqscript: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> ScriptResult<RunSummary> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    config.verbose |= cli.verbose;

    // ── Load scripts ──────────────────────────────────────────────────────────
    let source = std::fs::read_to_string(&cli.script_file)?;
    let mut library = ScriptLibrary::new();
    let loaded = library.load_source(&cli.default_script_name(), &source)?;
    let entry = match &cli.entry {
        Some(name) => name.clone(),
        None => loaded.first().map_or_else(String::new, |&i| library.script(i).name().to_owned()),
    };
    info!(file = %cli.script_file.display(), scripts = loaded.len(), "loaded");

    // ── Commands and simulator ────────────────────────────────────────────────
    let mut builder = CommandTableBuilder::new();
    SimulatedInstrument::register(&mut builder).map_err(seqscript::ScriptError::Config)?;
    let (tx, rx) = completion_channel();
    let sim = SimulatedInstrument::new(tx);

    let tick = config.tick_interval();
    let mut scheduler = Scheduler::new(library, builder.build(), sim, config);
    for (name, value) in &cli.vars {
        scheduler
            .interpreter_mut()
            .variables_mut()
            .set(name, value, Scope::Persistent)
            .map_err(seqscript::ScriptError::Config)?;
    }
    scheduler.start(&entry)?;

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let policy = if cli.auto_resume { PausePolicy::Resume } else { PausePolicy::Return };
    let mut host = HostLoop::new(scheduler, rx, tick).with_pause_policy(policy);
    let summary = host.run(|line| println!("{line}")).await;
    match &summary {
        RunSummary::Aborted(msg) => error!("{msg}"),
        RunSummary::Finished => info!("done"),
        _ => {}
    }
    Ok(summary)
}
