//! Known agent backends.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One of the supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Deterministic in-process simulator.
    #[default]
    Simulator,
    /// Claude agent driven through the SDK seam.
    ClaudeSdk,
    /// Codex CLI subprocess.
    CodexCli,
}

impl Provider {
    pub const ALL: [Self; 3] = [Self::Simulator, Self::ClaudeSdk, Self::CodexCli];

    /// Resolve a user-supplied backend name. Total: unknown names fall back
    /// to the simulator.
    pub fn resolve(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!(provider = name, "Unknown provider, falling back to simulator");
            Self::Simulator
        })
    }

    /// Strict lookup of a known spelling or alias.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "simulator" | "sim" | "mock" => Some(Self::Simulator),
            "claude" | "claude-sdk" | "claude-code" | "claude_sdk" => Some(Self::ClaudeSdk),
            "codex" | "codex-cli" | "codex_cli" => Some(Self::CodexCli),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulator => "simulator",
            Self::ClaudeSdk => "claude-sdk",
            Self::CodexCli => "codex-cli",
        }
    }

    /// Prefix of thread ids issued by this backend.
    pub const fn thread_prefix(self) -> &'static str {
        match self {
            Self::Simulator => "sim",
            Self::ClaudeSdk => "claude",
            Self::CodexCli => "codex",
        }
    }

    pub const fn is_subprocess(self) -> bool {
        !matches!(self, Self::Simulator)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(Provider::resolve("Claude-Code"), Provider::ClaudeSdk);
        assert_eq!(Provider::resolve(" codex "), Provider::CodexCli);
        assert_eq!(Provider::resolve("MOCK"), Provider::Simulator);
    }

    #[test]
    fn unknown_names_fall_back_to_simulator() {
        assert_eq!(Provider::resolve("gpt-9000"), Provider::Simulator);
        assert_eq!(Provider::resolve(""), Provider::Simulator);
        assert!(Provider::parse("gpt-9000").is_none());
    }

    #[test]
    fn canonical_names_round_trip() {
        for provider in Provider::ALL {
            assert_eq!(Provider::parse(provider.as_str()), Some(provider));
        }
    }
}
