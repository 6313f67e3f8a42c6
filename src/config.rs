//! Run configuration
//!
//! Settings come from three layers, later ones winning:
//! `~/.config/fixloop/config.toml`, then `<repo>/.fixloop.toml` (or the file
//! passed with `--config`), then command-line flags. Every field has a
//! default, so an empty or missing file is fine. A file that does not parse
//! is an error.

use crate::proposer::ProviderKind;
use crate::safety::SafetyPolicy;
use crate::validate::ValidatorPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const REPO_CONFIG_FILE: &str = ".fixloop.toml";
/// Working directory for run artifacts and test reports, inside the repo.
pub const WORK_DIR: &str = ".fixloop";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub max_iterations: usize,
    /// Wall-clock budget for the whole run.
    pub timeout_secs: u64,
    /// Empty means detect from the project layout.
    pub test_command: Vec<String>,
    pub test_timeout_secs: u64,
    pub proposer_command: Vec<String>,
    pub proposer_timeout_secs: u64,
    pub provider: ProviderKind,
    pub model: Option<String>,
    /// Ask the proposer command to review diffs that pass the safety guard.
    pub use_reviewer: bool,
    pub branch_prefix: String,
    /// Defaults to `<repo>/.fixloop/runs`.
    pub artifact_root: Option<PathBuf>,
    /// Added to `.git/info/exclude` so test byproducts never get committed.
    pub exclude_patterns: Vec<String>,
    pub log_level: String,
    pub safety: SafetyPolicy,
    pub validator: ValidatorPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            timeout_secs: 30 * 60,
            test_command: Vec::new(),
            test_timeout_secs: 10 * 60,
            proposer_command: Vec::new(),
            proposer_timeout_secs: 5 * 60,
            provider: ProviderKind::default(),
            model: None,
            use_reviewer: false,
            branch_prefix: "fixloop".to_string(),
            artifact_root: None,
            exclude_patterns: vec![
                "__pycache__/".to_string(),
                ".pytest_cache/".to_string(),
                "*.pyc".to_string(),
            ],
            log_level: "info".to_string(),
            safety: SafetyPolicy::default(),
            validator: ValidatorPolicy::default(),
        }
    }
}

/// Command-line values that take precedence over files.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_iterations: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub proposer_command: Option<Vec<String>>,
    pub test_command: Option<Vec<String>>,
    pub use_reviewer: bool,
    pub log_level: Option<String>,
}

impl RunConfig {
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fixloop").join("config.toml"))
    }

    /// Load the layered config for `repo_root`. `explicit` replaces the
    /// repo-level file and must exist.
    pub fn load(repo_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        Self::load_from(Self::user_config_path().as_deref(), repo_root, explicit)
    }

    fn load_from(user: Option<&Path>, repo_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut merged = toml::Table::new();
        if let Some(path) = user.filter(|p| p.is_file()) {
            merge_tables(&mut merged, read_table(path)?);
        }
        match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("Config file not found: {}", path.display());
                }
                merge_tables(&mut merged, read_table(path)?);
            }
            None => {
                let path = repo_root.join(REPO_CONFIG_FILE);
                if path.is_file() {
                    merge_tables(&mut merged, read_table(&path)?);
                }
            }
        }

        let config: RunConfig = toml::Value::Table(merged)
            .try_into()
            .context("Invalid fixloop configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(n) = overrides.max_iterations {
            self.max_iterations = n;
        }
        if let Some(secs) = overrides.timeout_secs {
            self.timeout_secs = secs;
        }
        if let Some(provider) = overrides.provider {
            self.provider = provider;
        }
        if overrides.model.is_some() {
            self.model = overrides.model;
        }
        if let Some(argv) = overrides.proposer_command.filter(|a| !a.is_empty()) {
            self.proposer_command = argv;
        }
        if let Some(argv) = overrides.test_command.filter(|a| !a.is_empty()) {
            self.test_command = argv;
        }
        if overrides.use_reviewer {
            self.use_reviewer = true;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        if self.branch_prefix.trim().is_empty() {
            bail!("branch_prefix must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn proposer_timeout(&self) -> Duration {
        Duration::from_secs(self.proposer_timeout_secs)
    }

    pub fn artifact_root(&self, repo_root: &Path) -> PathBuf {
        match &self.artifact_root {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => repo_root.join(path),
            None => repo_root.join(WORK_DIR).join("runs"),
        }
    }

    pub fn report_path(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(WORK_DIR).join("junit.xml")
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let table = toml::from_str::<toml::Table>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(table)
}

/// Merge `overlay` into `base`; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_give_defaults() {
        let root = tempdir().unwrap();
        let config = RunConfig::load_from(None, root.path(), None).unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.max_iterations, 5);
        assert_eq!(
            config.artifact_root(root.path()),
            root.path().join(".fixloop/runs")
        );
    }

    #[test]
    fn repo_file_overrides_user_file_per_key() {
        let root = tempdir().unwrap();
        let user = root.path().join("user.toml");
        fs::write(
            &user,
            "max_iterations = 8\nprovider = \"anthropic\"\n[safety]\nmax_files_modified = 2\n",
        )
        .unwrap();
        fs::write(
            root.path().join(REPO_CONFIG_FILE),
            "max_iterations = 3\n[safety]\nmax_lines_changed = 40\n",
        )
        .unwrap();

        let config = RunConfig::load_from(Some(&user), root.path(), None).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.provider, ProviderKind::Anthropic);
        assert_eq!(config.safety.max_files_modified, 2);
        assert_eq!(config.safety.max_lines_changed, 40);
    }

    #[test]
    fn malformed_or_unknown_keys_are_errors() {
        let root = tempdir().unwrap();
        fs::write(root.path().join(REPO_CONFIG_FILE), "max_iterations = [").unwrap();
        assert!(RunConfig::load_from(None, root.path(), None).is_err());

        fs::write(root.path().join(REPO_CONFIG_FILE), "max_iteration = 3\n").unwrap();
        assert!(RunConfig::load_from(None, root.path(), None).is_err());

        fs::write(root.path().join(REPO_CONFIG_FILE), "max_iterations = 0\n").unwrap();
        assert!(RunConfig::load_from(None, root.path(), None).is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        let root = tempdir().unwrap();
        let missing = root.path().join("nope.toml");
        assert!(RunConfig::load_from(None, root.path(), Some(&missing)).is_err());
    }

    #[test]
    fn overrides_win() {
        let mut config = RunConfig::default();
        config.apply(Overrides {
            max_iterations: Some(2),
            proposer_command: Some(vec!["./propose.sh".to_string()]),
            test_command: Some(Vec::new()),
            use_reviewer: true,
            ..Overrides::default()
        });
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.proposer_command, vec!["./propose.sh"]);
        assert!(config.test_command.is_empty());
        assert!(config.use_reviewer);
    }
}
