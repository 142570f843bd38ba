//! Engine configuration file (`seqscript.toml`).
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working engine:
//!
//! ```toml
//! max_call_depth = 40
//! max_block_depth = 100
//! fast_path_iterations = 100
//! fast_path_budget_ms = 30
//! tick_interval_ms = 10
//! verbose = false
//!
//! [limits]
//! max_run_seconds = 3600.0
//! max_dispatches = 100000
//! max_errors = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::error::{ScriptError, ScriptResult};

pub const CONFIG_FILE_NAME: &str = "seqscript.toml";

/// Optional termination conditions; reaching one suspends the run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunLimits {
    pub max_run_seconds: Option<f64>,
    pub max_dispatches: Option<u64>,
    /// Errors caught by `Try` blocks.
    pub max_errors: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_call_depth: usize,
    pub max_block_depth: usize,
    /// Lines run back to back in one tick before yielding to the host.
    pub fast_path_iterations: usize,
    pub fast_path_budget_ms: u64,
    pub tick_interval_ms: u64,
    pub verbose: bool,
    pub limits: RunLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_call_depth: 40,
            max_block_depth: 100,
            fast_path_iterations: 100,
            fast_path_budget_ms: 30,
            tick_interval_ms: 10,
            verbose: false,
            limits: RunLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> ScriptResult<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> ScriptResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| match e {
            ScriptError::Config(msg) => ScriptError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Load `explicit` if given, else the default file if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> ScriptResult<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }
        match default_path() {
            Some(path) if path.is_file() => Self::load_file(&path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> ScriptResult<()> {
        let positive = [
            ("max_call_depth", self.max_call_depth),
            ("max_block_depth", self.max_block_depth),
            ("fast_path_iterations", self.fast_path_iterations),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ScriptError::Config(format!("{name} must be at least 1")));
        }
        if self.limits.max_run_seconds.is_some_and(|s| !(s > 0.0)) {
            return Err(ScriptError::Config("limits.max_run_seconds must be positive".into()));
        }
        Ok(())
    }

    pub fn fast_path_budget(&self) -> Duration {
        Duration::from_millis(self.fast_path_budget_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// `<config_dir>/seqscript.toml` for the current user.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "seqscript").map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_override() {
        let c = EngineConfig::from_toml("max_call_depth = 5\n[limits]\nmax_errors = 3\n").unwrap();
        assert_eq!(c.max_call_depth, 5);
        assert_eq!(c.max_block_depth, 100);
        assert_eq!(c.limits.max_errors, Some(3));
        assert_eq!(c.limits.max_dispatches, None);
    }

    #[test]
    fn rejects_unknown_and_invalid() {
        assert!(matches!(EngineConfig::from_toml("bogus = 1"), Err(ScriptError::Config(_))));
        assert!(EngineConfig::from_toml("max_block_depth = 0").is_err());
        assert!(EngineConfig::from_toml("[limits]\nmax_run_seconds = -1.0").is_err());
    }

    #[test]
    fn loads_explicit_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "verbose = true").unwrap();
        let c = EngineConfig::load(Some(f.path())).unwrap();
        assert!(c.verbose);
        assert!(matches!(
            EngineConfig::load(Some(Path::new("/nonexistent/seqscript.toml"))),
            Err(ScriptError::Io(_))
        ));
    }
}
