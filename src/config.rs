use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Settings delivered by the external configuration store.
///
/// Both roots are required; the engine refuses to start without them.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Authoritative copy of the data.
    pub server_path: PathBuf,
    /// Directory projected to the user as placeholders.
    pub client_path: PathBuf,

    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    #[serde(default = "default_account_name")]
    pub account_name: String,
    /// Name shown in the Explorer navigation pane. Defaults to the provider
    /// name.
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub tuning: Tuning,
}

fn default_provider_name() -> String {
    "NuviiSync".into()
}

fn default_account_name() -> String {
    "NuviiAccount".into()
}

impl SyncConfig {
    pub fn new(server_path: impl Into<PathBuf>, client_path: impl Into<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
            client_path: client_path.into(),
            provider_name: default_provider_name(),
            account_name: default_account_name(),
            display_name: None,
            tuning: Tuning::default(),
        }
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_path.as_os_str().is_empty() || self.client_path.as_os_str().is_empty() {
            return Err(SyncError::Config(
                "server_path and client_path are required".into(),
            ));
        }
        if self.provider_name.contains('!') || self.account_name.contains('!') {
            // The shell reserves '!' as the sync-root id separator.
            return Err(SyncError::Config(
                "provider_name and account_name must not contain '!'".into(),
            ));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.provider_name)
    }
}

/// Engine timing knobs, all optional in the settings file.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Quiet period before a pending operation executes.
    pub debounce_ms: u64,
    /// How long a deletion stays eligible to pair with a create into a move.
    pub move_window_ms: u64,
    /// Lifetime of an echo-suppression entry.
    pub suppression_ttl_ms: u64,
    pub max_retries: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            move_window_ms: 5_000,
            suppression_ttl_ms: 5_000,
            max_retries: 3,
        }
    }
}

impl Tuning {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn move_window(&self) -> Duration {
        Duration::from_millis(self.move_window_ms)
    }

    pub fn suppression_ttl(&self) -> Duration {
        Duration::from_millis(self.suppression_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: SyncConfig = toml::from_str(
            r#"
            server_path = "/srv/nuvii"
            client_path = "/home/user/Nuvii"
            "#,
        )
        .unwrap();

        assert_eq!(config.provider_name, "NuviiSync");
        assert_eq!(config.tuning.debounce(), Duration::from_secs(3));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_exclamation_in_identity() {
        let mut config = SyncConfig::new("/srv", "/cli");
        config.provider_name = "Bad!Name".into();
        assert!(config.validate().is_err());
    }
}
