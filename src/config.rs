use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub connection: ConnectionTuning,
    pub playback: PlaybackConfig,
}

/// Generation service endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// WebSocket endpoint for the streaming protocol.
    pub ws_url: String,
    /// Base URL for the one-shot HTTP fallback API.
    pub api_url: String,
}

/// Connection lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionTuning {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
}

/// Audio playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Play narration automatically as fragments arrive.
    pub autoplay: bool,
    /// Output volume, 0.0 to 1.0.
    pub volume: f32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ws_url: defaults::SERVICE_WS_URL.to_string(),
            api_url: defaults::SERVICE_API_URL.to_string(),
        }
    }
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout_secs: defaults::HEARTBEAT_TIMEOUT_SECS,
            reconnect_delay_secs: defaults::RECONNECT_DELAY_SECS,
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            autoplay: true,
            volume: 1.0,
        }
    }
}

impl ConnectionTuning {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat acknowledgment timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Delay between reconnect attempts as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - STORYLOOM_WS_URL → service.ws_url
    /// - STORYLOOM_API_URL → service.api_url
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("STORYLOOM_WS_URL") {
            if !url.is_empty() {
                self.service.ws_url = url;
            }
        }

        if let Ok(url) = std::env::var("STORYLOOM_API_URL") {
            if !url.is_empty() {
                self.service.api_url = url;
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/storyloom/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("storyloom")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_storyloom_env() {
        remove_env("STORYLOOM_WS_URL");
        remove_env("STORYLOOM_API_URL");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.service.ws_url, "ws://localhost:8000/api/ws");
        assert_eq!(config.service.api_url, "http://localhost:8000/api");
        assert_eq!(config.connection.heartbeat_interval_secs, 30);
        assert_eq!(config.connection.heartbeat_timeout_secs, 5);
        assert_eq!(config.connection.reconnect_delay_secs, 3);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert!(config.playback.autoplay);
        assert_eq!(config.playback.volume, 1.0);
    }

    #[test]
    fn test_duration_accessors() {
        let tuning = ConnectionTuning::default();
        assert_eq!(tuning.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(tuning.heartbeat_timeout(), Duration::from_secs(5));
        assert_eq!(tuning.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_valid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
ws_url = "ws://example.com/ws"

[connection]
max_reconnect_attempts = 3

[playback]
autoplay = false
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.service.ws_url, "ws://example.com/ws");
        // Unspecified fields fall back to defaults
        assert_eq!(config.service.api_url, "http://localhost:8000/api");
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.heartbeat_interval_secs, 30);
        assert!(!config.playback.autoplay);
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not = valid [ toml").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_invalid_toml_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "broken = [").unwrap();

        assert!(Config::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_storyloom_env();

        set_env("STORYLOOM_WS_URL", "ws://override:9000/ws");
        set_env("STORYLOOM_API_URL", "http://override:9000/api");

        let config = Config::default().with_env_overrides();
        assert_eq!(config.service.ws_url, "ws://override:9000/ws");
        assert_eq!(config.service.api_url, "http://override:9000/api");

        clear_storyloom_env();
    }

    #[test]
    fn test_env_overrides_ignore_empty() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_storyloom_env();

        set_env("STORYLOOM_WS_URL", "");

        let config = Config::default().with_env_overrides();
        assert_eq!(config.service.ws_url, "ws://localhost:8000/api/ws");

        clear_storyloom_env();
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        assert!(path.to_string_lossy().ends_with("storyloom/config.toml"));
    }
}
