//! Configuration for the coordinator and its collaborators.
//!
//! Loaded from a single TOML file with `[ledger]`, `[llm]` and
//! `[conversation]` sections. On Unix the loader validates file permissions
//! before reading: credentials in a world-readable file are refused.

use munin_ledger::LedgerConfig;
use munin_llm::LlmConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuninConfig {
    /// Ledger collaborator connection
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Optional LLM provider. Without one the coordinator runs on keyword
    /// triage and workers reply with deterministic templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    /// Turn pipeline limits
    #[serde(default)]
    pub conversation: ConversationConfig,
}

/// Limits for one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Delegation chain cap; a request already at this depth is refused
    #[serde(default = "default_max_depth")]
    pub max_delegation_depth: u32,

    /// Wall-clock budget for one delegation, in milliseconds
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_ms: u64,
}

fn default_max_depth() -> u32 {
    3
}

fn default_turn_timeout() -> u64 {
    30_000
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: default_max_depth(),
            turn_timeout_ms: default_turn_timeout(),
        }
    }
}

impl MuninConfig {
    /// Read configuration from a TOML file.
    ///
    /// On Unix the loader first validates that:
    /// - the path is a regular file (not a symlink or directory)
    /// - the file is not world-writable
    /// - a file containing an API key is not world-readable
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;

        let key_in_file = config.ledger.api_key.is_some()
            || config.llm.as_ref().is_some_and(|llm| llm.api_key.is_some());
        if key_in_file {
            warn!(
                "Config file '{}' carries an API key in plain text. Prefer \
                 the environment variables (MUNIN_LEDGER_API_KEY, \
                 OPENAI_API_KEY, ANTHROPIC_API_KEY).",
                path.display()
            );
        }

        Ok(config)
    }

    /// Read a TOML config without the permission checks.
    ///
    /// For tests and for files that were already validated elsewhere.
    pub fn from_file_unchecked(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Permission checks applied before a config file is read on Unix.
///
/// Checks:
/// - the path is a regular file
/// - the file is not world-writable
/// - a file that looks like it contains an API key is not world-readable
#[cfg(unix)]
fn validate_config_file_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("Cannot stat config file '{}': {}", path.display(), e))?;

    if !metadata.is_file() {
        anyhow::bail!(
            "Config path '{}' must be a regular file, not a symlink or directory.",
            path.display()
        );
    }

    let mode = metadata.permissions().mode();
    let permission_bits = mode & 0o777;

    if permission_bits & 0o002 != 0 {
        anyhow::bail!(
            "Config file '{}' is world-writable (mode {:04o}). \
             Anyone on the host could rewrite it. Run: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    let has_api_key =
        content.contains("api_key") && (content.contains("sk-") || content.contains("key ="));

    if has_api_key && permission_bits & 0o004 != 0 {
        anyhow::bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). \
             Anyone on the host can read the key. Run: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    if has_api_key && permission_bits & 0o040 != 0 {
        warn!(
            "Config file '{}' contains an API key and is group-readable (mode {:04o}). \
             Tighten it with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
[ledger]
backend = "memory"

[llm]
provider = "openai"
model = "llama3.2"
api_url = "http://localhost:11434"

[conversation]
max_delegation_depth = 5
turn_timeout_ms = 10000
"#;

    #[test]
    fn test_defaults() {
        let config = MuninConfig::default();
        assert_eq!(config.ledger.backend, "http");
        assert!(config.llm.is_none());
        assert_eq!(config.conversation.max_delegation_depth, 3);
        assert_eq!(config.conversation.turn_timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let config: MuninConfig = toml::from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.ledger.backend, "memory");
        let llm = config.llm.unwrap();
        assert_eq!(llm.provider, "openai");
        assert_eq!(llm.model, "llama3.2");
        assert_eq!(config.conversation.max_delegation_depth, 5);
        assert_eq!(config.conversation.turn_timeout_ms, 10_000);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: MuninConfig = toml::from_str("").unwrap();
        assert_eq!(config.ledger.backend, "http");
        assert!(config.llm.is_none());
        assert_eq!(config.conversation.max_delegation_depth, 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_file_rejects_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[ledger]\nbackend = \"memory\"\n").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o666)).unwrap();

        let err = MuninConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("world-writable"));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_file_rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[ledger]\nbackend = \"http\"\napi_key = \"sk-secret\"\n")
            .unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = MuninConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("world-readable"));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_file_accepts_private_file() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();

        let config = MuninConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ledger.backend, "memory");
    }

    #[test]
    fn test_from_file_unchecked_skips_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();

        let config = MuninConfig::from_file_unchecked(file.path()).unwrap();
        assert_eq!(config.conversation.max_delegation_depth, 5);
    }
}
