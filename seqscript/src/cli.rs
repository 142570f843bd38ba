//! Command-line arguments for the `seqscript` runner.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::script::value::Value;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "seqscript", version, about = "Run an automation script against the simulated instrument")]
pub struct Cli {
    /// Script file; `Script NAME` lines split it into several scripts.
    pub script_file: PathBuf,

    /// Script to start (name or 1-based number); defaults to the first one.
    #[arg(short, long)]
    pub entry: Option<String>,

    /// Engine configuration file (TOML).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Echo every line as it is dispatched.
    #[arg(short, long)]
    pub verbose: bool,

    /// Resume at once when the script pauses itself or hits a run limit.
    #[arg(long)]
    pub auto_resume: bool,

    /// Preset a persistent variable before the run.
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub vars: Vec<(String, Value)>,
}

fn parse_assignment(s: &str) -> Result<(String, Value), String> {
    let (name, value) = s.split_once('=').ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let name = name.trim();
    if !crate::script::vars::valid_name(name) {
        return Err(format!("illegal variable name '{name}'"));
    }
    Ok((name.to_owned(), Value::parse(value.trim())))
}

impl Cli {
    /// Name given to a script file without `Script` headers.
    pub fn default_script_name(&self) -> String {
        stem(&self.script_file)
    }
}

fn stem(path: &Path) -> String {
    path.file_stem().map_or_else(|| "main".to_owned(), |s| s.to_string_lossy().into_owned())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_command_line() {
        let cli = Cli::try_parse_from([
            "seqscript", "runs/tilt.txt", "--entry", "Tilt", "--var", "n=3", "--var", "label=a b", "-v",
        ])
        .unwrap();
        assert_eq!(cli.entry.as_deref(), Some("Tilt"));
        assert!(cli.verbose);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.vars, vec![("n".into(), Value::Int(3)), ("label".into(), Value::Str("a b".into()))]);
        assert_eq!(cli.default_script_name(), "tilt");
    }

    #[test]
    fn rejects_bad_vars() {
        assert!(Cli::try_parse_from(["seqscript", "f", "--var", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["seqscript", "f", "--var", "1x=2"]).is_err());
        assert!(Cli::try_parse_from(["seqscript"]).is_err());
    }
}
