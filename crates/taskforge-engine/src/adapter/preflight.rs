//! Credential and binary preflight for subprocess-backed providers.
//!
//! Preflight never fails with an error: every problem becomes a remediation
//! line in [`Readiness::instructions`] for whatever UI sits above.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use taskforge_core::config::ProvidersConfig;
use tracing::{debug, info, warn};

use super::provider::Provider;

/// Credential hydrated for a provider.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// API key, exported to the agent process environment.
    ApiKey(String),
    /// Login state kept by the CLI itself in this file.
    ConfigFile(PathBuf),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::ConfigFile(path) => f.debug_tuple("ConfigFile").field(path).finish(),
        }
    }
}

/// Outcome of a preflight check.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub provider: Provider,
    pub ready: bool,
    pub instructions: Vec<String>,
    pub credential: Option<Credential>,
    /// Resolved executable, when one was found.
    pub binary: Option<PathBuf>,
    /// First line of `--version`, when the probe succeeded.
    pub version: Option<String>,
}

impl Readiness {
    /// Ready, with nothing found or required.
    pub fn ready(provider: Provider) -> Self {
        Self {
            provider,
            ready: true,
            instructions: Vec::new(),
            credential: None,
            binary: None,
            version: None,
        }
    }
}

/// Environment variable carrying the provider's API key.
pub const fn api_key_var(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::Simulator => None,
        Provider::ClaudeSdk => Some("ANTHROPIC_API_KEY"),
        Provider::CodexCli => Some("OPENAI_API_KEY"),
    }
}

/// Executable configured for the provider.
pub fn binary_name(provider: Provider, config: &ProvidersConfig) -> Option<&str> {
    match provider {
        Provider::Simulator => None,
        Provider::ClaudeSdk => Some(&config.claude_bin),
        Provider::CodexCli => Some(&config.codex_bin),
    }
}

/// Run preflight against the real environment and home directory.
pub async fn preflight(provider: Provider, config: &ProvidersConfig) -> Readiness {
    let home = dirs::home_dir();
    preflight_with(
        provider,
        config,
        &|key: &str| std::env::var(key).ok(),
        home.as_deref(),
    )
    .await
}

/// Preflight with injected environment lookup and home directory.
pub async fn preflight_with(
    provider: Provider,
    config: &ProvidersConfig,
    env: &(dyn Fn(&str) -> Option<String> + Sync),
    home: Option<&Path>,
) -> Readiness {
    let Some(bin) = binary_name(provider, config) else {
        return Readiness::ready(provider);
    };

    let mut readiness = Readiness::ready(provider);

    match which::which(bin) {
        Ok(path) => {
            let timeout = Duration::from_secs(config.preflight_timeout_secs);
            match probe_version(&path, timeout).await {
                Ok(version) => readiness.version = Some(version),
                Err(reason) => {
                    readiness.ready = false;
                    readiness.instructions.push(format!(
                        "`{} --version` failed ({reason}); reinstall or update the {provider} CLI",
                        path.display()
                    ));
                }
            }
            readiness.binary = Some(path);
        }
        Err(e) => {
            debug!(provider = %provider, bin, error = %e, "Executable not found on PATH");
            readiness.ready = false;
            readiness.instructions.push(format!(
                "Install the `{bin}` executable and make sure it is on PATH"
            ));
            readiness.instructions.push(install_hint(provider).to_string());
        }
    }

    readiness.credential = find_credential(provider, env, home);
    if readiness.credential.is_none() {
        readiness.ready = false;
        readiness
            .instructions
            .extend(credential_hints(provider).iter().map(ToString::to_string));
    }

    if readiness.ready {
        info!(provider = %provider, version = ?readiness.version, "Provider ready");
    } else {
        warn!(provider = %provider, instructions = ?readiness.instructions, "Provider not ready");
    }
    readiness
}

const fn install_hint(provider: Provider) -> &'static str {
    match provider {
        Provider::ClaudeSdk => "Install with: npm install -g @anthropic-ai/claude-code",
        Provider::CodexCli => "Install with: npm install -g @openai/codex",
        Provider::Simulator => "",
    }
}

const fn credential_hints(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::ClaudeSdk => &[
            "Run `claude login`, or export ANTHROPIC_API_KEY",
            "Credentials are read from ~/.claude/.credentials.json",
        ],
        Provider::CodexCli => &[
            "Run `codex login`, or export OPENAI_API_KEY",
            "Credentials are read from ~/.codex/auth.json",
        ],
        Provider::Simulator => &[],
    }
}

/// Run `<bin> --version`, bounded by `timeout`.
async fn probe_version(bin: &Path, timeout: Duration) -> Result<String, String> {
    let output = tokio::process::Command::new(bin)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(out)) if !out.status.success() => Err(format!("exit status {}", out.status)),
        Ok(Ok(out)) => Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()),
    }
}

/// Locate a credential: environment first, then the CLI's own config file.
pub fn find_credential(
    provider: Provider,
    env: &(dyn Fn(&str) -> Option<String> + Sync),
    home: Option<&Path>,
) -> Option<Credential> {
    if let Some(key) = api_key_var(provider)
        .and_then(env)
        .filter(|v| !v.trim().is_empty())
    {
        return Some(Credential::ApiKey(key));
    }

    let home = home?;
    match provider {
        Provider::Simulator => None,
        Provider::ClaudeSdk => {
            let path = home.join(".claude").join(".credentials.json");
            let doc = read_json(&path)?;
            doc.get("claudeAiOauth")
                .and_then(|o| o.get("accessToken"))
                .and_then(Value::as_str)
                .is_some()
                .then_some(Credential::ConfigFile(path))
        }
        Provider::CodexCli => {
            let path = home.join(".codex").join("auth.json");
            let doc = read_json(&path)?;
            if let Some(key) = doc
                .get("OPENAI_API_KEY")
                .and_then(Value::as_str)
                .filter(|k| !k.is_empty())
            {
                return Some(Credential::ApiKey(key.to_string()));
            }
            doc.get("tokens")
                .is_some_and(Value::is_object)
                .then_some(Credential::ConfigFile(path))
        }
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content)
        .map_err(|e| warn!(path = %path.display(), error = %e, "Unreadable credentials file"))
        .ok()
}
