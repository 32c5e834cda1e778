use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};

/// Tunable options, loaded from `sherpa-sync.toml` in the data directory.
///
/// Every field has a sensible default so the crate works out-of-the-box
/// without any config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// File name of the encrypted settings blob inside the data directory.
    #[serde(default = "default_settings_file")]
    pub settings_file: String,

    /// Total request timeout for remote provider calls, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Connect timeout for remote provider calls, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long a certificate-store enumeration stays cached, in seconds.
    #[serde(default = "default_certificate_cache_ttl_secs")]
    pub certificate_cache_ttl_secs: u64,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_settings_file() -> String {
    "settings.dat".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_certificate_cache_ttl_secs() -> u64 {
    300
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            certificate_cache_ttl_secs: default_certificate_cache_ttl_secs(),
        }
    }
}

impl SyncOptions {
    /// Name of the config file we look for in the data directory.
    const FILE_NAME: &'static str = "sherpa-sync.toml";

    /// Load options from `<data_dir>/sherpa-sync.toml`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;

        let options: SyncOptions = toml::from_str(&contents).map_err(|e| {
            SyncError::ConfigError(format!("Failed to parse {}: {e}", config_path.display()))
        })?;

        Ok(options)
    }

    /// Build the full path to the encrypted settings file.
    pub fn settings_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.settings_file)
    }

    /// Total request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Certificate-enumeration cache TTL as a `Duration`.
    pub fn certificate_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.certificate_cache_ttl_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_options_are_sensible() {
        let o = SyncOptions::default();
        assert_eq!(o.settings_file, "settings.dat");
        assert_eq!(o.request_timeout_secs, 30);
        assert_eq!(o.connect_timeout_secs, 10);
        assert_eq!(o.certificate_cache_ttl_secs, 300);
    }

    #[test]
    fn load_returns_defaults_when_no_config_file() {
        let tmp = TempDir::new().unwrap();
        let options = SyncOptions::load(tmp.path()).unwrap();
        assert_eq!(options.settings_file, "settings.dat");
    }

    #[test]
    fn load_parses_toml_file() {
        let tmp = TempDir::new().unwrap();
        let config = r#"
settings_file = "profile.bin"
request_timeout_secs = 60
connect_timeout_secs = 5
certificate_cache_ttl_secs = 120
"#;
        fs::write(tmp.path().join("sherpa-sync.toml"), config).unwrap();

        let options = SyncOptions::load(tmp.path()).unwrap();
        assert_eq!(options.settings_file, "profile.bin");
        assert_eq!(options.request_timeout_secs, 60);
        assert_eq!(options.connect_timeout_secs, 5);
        assert_eq!(options.certificate_cache_ttl_secs, 120);
    }

    #[test]
    fn load_uses_defaults_for_missing_fields() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("sherpa-sync.toml"),
            "request_timeout_secs = 90\n",
        )
        .unwrap();

        let options = SyncOptions::load(tmp.path()).unwrap();
        assert_eq!(options.request_timeout_secs, 90);
        // Rest should be defaults
        assert_eq!(options.settings_file, "settings.dat");
        assert_eq!(options.certificate_cache_ttl_secs, 300);
    }

    #[test]
    fn load_errors_on_invalid_toml() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("sherpa-sync.toml"), "not valid {{toml").unwrap();

        let result = SyncOptions::load(tmp.path());
        assert!(result.is_err());
    }

    #[test]
    fn settings_path_builds_correct_path() {
        let o = SyncOptions::default();
        let dir = Path::new("/home/user/.sherpa");
        assert_eq!(
            o.settings_path(dir),
            PathBuf::from("/home/user/.sherpa/settings.dat")
        );
    }
}
