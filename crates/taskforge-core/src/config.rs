//! Configuration resolution for TaskForge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/taskforge/settings.json)
//! 3. Project config (.taskforge/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Config files are partial: any key left out keeps the value from the
//! layer below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete TaskForge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub providers: ProvidersConfig,
    pub worktrees: WorktreeConfig,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

/// Agent pool and generation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent running sessions per Agent Manager.
    pub max_concurrent_agents: usize,
    /// Corrective re-invocations after unparseable output.
    pub max_parse_retries: u32,
    /// Corrective re-invocations after a plan fails structural validation.
    pub max_validation_retries: u32,
    pub default_provider: String,
    pub use_worktrees: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 12,
            max_parse_retries: 2,
            max_validation_retries: 2,
            default_provider: "simulator".to_string(),
            use_worktrees: true,
        }
    }
}

/// External agent backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub claude_bin: String,
    pub codex_bin: String,
    pub claude_model: Option<String>,
    pub codex_model: Option<String>,
    /// Upper bound for the `--version` identity probe.
    pub preflight_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude_bin: "claude".to_string(),
            codex_bin: "codex".to_string(),
            claude_model: None,
            codex_model: None,
            preflight_timeout_secs: 5,
            terminate_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Isolation root, relative to the repository root.
    pub root_dir: PathBuf,
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".taskforge/worktrees"),
            branch_prefix: "taskforge/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Artificial delay between simulated events.
    pub step_delay_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self { step_delay_ms: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(project_config_path);
    let mut config = load_layers(global.as_deref(), project.as_deref())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the file layers over the defaults. Missing files are skipped.
pub fn load_layers(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    for path in [global, project].into_iter().flatten() {
        if path.exists() {
            merge_json(&mut merged, load_config_file(path)?);
        }
    }

    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid settings: {e}")))
}

/// Path of the project settings file.
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".taskforge").join("settings.json")
}

/// Global settings file under the platform config directory
/// (`$XDG_CONFIG_HOME`, `~/Library/Application Support`, `%APPDATA%`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("taskforge").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything
/// else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `TASKFORGE_*` overrides. `lookup` is injected so tests need not
/// touch the process environment.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("TASKFORGE_MAX_AGENTS").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_concurrent_agents = n;
    }
    if let Some(val) = lookup("TASKFORGE_DEFAULT_PROVIDER") {
        config.orchestrator.default_provider = val;
    }
    if let Some(val) = lookup("TASKFORGE_CLAUDE_BIN") {
        config.providers.claude_bin = val;
    }
    if let Some(val) = lookup("TASKFORGE_CODEX_BIN") {
        config.providers.codex_bin = val;
    }
    if let Some(val) = lookup("TASKFORGE_LOG_LEVEL") {
        config.logging.level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_concurrent_agents, 12);
        assert_eq!(config.orchestrator.max_parse_retries, 2);
        assert_eq!(config.orchestrator.default_provider, "simulator");
        assert_eq!(config.worktrees.branch_prefix, "taskforge/");
        assert_eq!(config.providers.preflight_timeout_secs, 5);
    }

    #[test]
    fn project_layer_overrides_global_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"orchestrator":{"max_parse_retries":5,"default_provider":"codex"}}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"orchestrator":{"default_provider":"claude"}}"#).unwrap();

        let config = load_layers(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.orchestrator.max_parse_retries, 5);
        assert_eq!(config.orchestrator.default_provider, "claude");
        assert_eq!(config.orchestrator.max_concurrent_agents, 12);
    }

    #[test]
    fn global_settings_live_in_the_platform_config_dir() {
        let expected = dirs::config_dir().map(|d| d.join("taskforge").join("settings.json"));
        assert_eq!(global_config_path(), expected);
        if let Some(path) = global_config_path() {
            assert!(path.ends_with("taskforge/settings.json"));
        }
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_layers(Some(&dir.path().join("absent.json")), None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_layers(Some(&path), None), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = [
            ("TASKFORGE_MAX_AGENTS", "3"),
            ("TASKFORGE_CODEX_BIN", "/opt/codex"),
            ("TASKFORGE_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));
        assert_eq!(config.orchestrator.max_concurrent_agents, 3);
        assert_eq!(config.providers.codex_bin, "/opt/codex");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.providers.claude_bin, "claude");
    }

    #[test]
    fn unparseable_numeric_env_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == "TASKFORGE_MAX_AGENTS").then(|| "many".to_string())
        });
        assert_eq!(config.orchestrator.max_concurrent_agents, 12);
    }
}
