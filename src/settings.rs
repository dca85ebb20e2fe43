use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::DEFAULT_BLOCK_SIZE;
use crate::streaming::{ConnectOptions, DEFAULT_CONTROL_URL, DEFAULT_SERVER_URL};

const SETTINGS_DIR_NAME: &str = "voicelink";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Largest playback backlog accepted from settings (10 minutes)
const MAX_QUEUED_MS: u64 = 600_000;
/// Largest base retry delay accepted from settings
const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;

/// Environment variable overriding `server_url`
pub const ENV_SERVER_URL: &str = "VOICELINK_SERVER_URL";
/// Environment variable overriding `control_url`
pub const ENV_CONTROL_URL: &str = "VOICELINK_CONTROL_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// WebSocket endpoint of the voice server.
    pub server_url: String,

    /// Base URL for out-of-band session control (force stop).
    pub control_url: String,

    /// Samples per outbound capture block (16kHz).
    pub block_size: usize,

    /// Upper bound on queued playback audio. When exceeded, the oldest queued
    /// buffers are dropped. 0 disables the bound.
    pub max_queued_ms: u64,

    /// Timeout for each WebSocket handshake attempt.
    pub connect_timeout_ms: u64,

    /// Connection attempts before giving up.
    pub connect_attempts: u32,

    /// Base delay between connection attempts (doubles each retry).
    pub retry_base_delay_ms: u64,

    /// Outbound capture blocks buffered ahead of the socket writer.
    pub send_queue_frames: usize,

    /// Connect on startup instead of waiting for the `connect` command.
    pub auto_connect: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            control_url: DEFAULT_CONTROL_URL.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_queued_ms: 30_000,
            connect_timeout_ms: 10_000,
            connect_attempts: 3,
            retry_base_delay_ms: 1_000,
            send_queue_frames: 32,
            auto_connect: true,
        }
    }
}

impl ClientSettings {
    /// Transport tunables derived from these settings
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            attempts: self.connect_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            send_queue_frames: self.send_queue_frames.max(1),
        }
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            log::info!("Settings: server URL overridden by {}", ENV_SERVER_URL);
            self.server_url = url.trim().to_string();
        }
        if let Some(url) = lookup(ENV_CONTROL_URL).filter(|v| !v.trim().is_empty()) {
            log::info!("Settings: control URL overridden by {}", ENV_CONTROL_URL);
            self.control_url = url.trim().to_string();
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Replace values that cannot work with their defaults
    pub fn sanitize(&mut self) {
        if self.block_size == 0 {
            log::warn!(
                "Settings: block_size 0 is invalid, using {}",
                DEFAULT_BLOCK_SIZE
            );
            self.block_size = DEFAULT_BLOCK_SIZE;
        }
        if self.max_queued_ms > MAX_QUEUED_MS {
            log::warn!(
                "Settings: max_queued_ms {} is too large, using {}",
                self.max_queued_ms,
                MAX_QUEUED_MS
            );
            self.max_queued_ms = MAX_QUEUED_MS;
        }
        if self.retry_base_delay_ms > MAX_RETRY_BASE_DELAY_MS {
            log::warn!(
                "Settings: retry_base_delay_ms {} is too large, using {}",
                self.retry_base_delay_ms,
                MAX_RETRY_BASE_DELAY_MS
            );
            self.retry_base_delay_ms = MAX_RETRY_BASE_DELAY_MS;
        }
        if self.connect_attempts == 0 {
            log::warn!("Settings: connect_attempts 0 is invalid, using 1");
            self.connect_attempts = 1;
        }
        let trimmed = self.control_url.trim_end_matches('/').len();
        self.control_url.truncate(trimmed);
    }
}

/// Default settings location: `<config_dir>/voicelink/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from `path`, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn load_settings() -> ClientSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Windows, rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

pub fn save_settings(settings: &ClientSettings) -> Result<PathBuf, String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, ClientSettings::default());
        assert_eq!(settings.server_url, "ws://localhost:8000/ws/audio");
        assert_eq!(settings.block_size, 4096);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voicelink").join("settings.json");

        let settings = ClientSettings {
            server_url: "wss://voice.example.com/ws/audio".to_string(),
            max_queued_ms: 5_000,
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "block_size": 2048 }"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.block_size, 2048);
        assert_eq!(settings.control_url, "http://localhost:8000");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_settings_from(&path), ClientSettings::default());
    }

    #[test]
    fn test_overrides() {
        let mut settings = ClientSettings::default();
        settings.apply_overrides(|key| match key {
            ENV_SERVER_URL => Some("ws://10.0.0.2:9000/ws/audio".to_string()),
            ENV_CONTROL_URL => Some("   ".to_string()),
            _ => None,
        });

        assert_eq!(settings.server_url, "ws://10.0.0.2:9000/ws/audio");
        assert_eq!(settings.control_url, "http://localhost:8000");
    }

    #[test]
    fn test_sanitize() {
        let mut settings = ClientSettings {
            block_size: 0,
            connect_attempts: 0,
            control_url: "http://localhost:8000/".to_string(),
            ..Default::default()
        };
        settings.sanitize();

        assert_eq!(settings.block_size, 4096);
        assert_eq!(settings.connect_attempts, 1);
        assert_eq!(settings.control_url, "http://localhost:8000");
    }

    #[test]
    fn test_sanitize_clamps_huge_values() {
        let mut settings = ClientSettings {
            max_queued_ms: u64::MAX,
            retry_base_delay_ms: u64::MAX,
            ..Default::default()
        };
        settings.sanitize();

        assert_eq!(settings.max_queued_ms, MAX_QUEUED_MS);
        assert_eq!(settings.retry_base_delay_ms, MAX_RETRY_BASE_DELAY_MS);
        assert_eq!(settings.connect_options().retry_base_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_connect_options() {
        let settings = ClientSettings {
            connect_timeout_ms: 500,
            send_queue_frames: 0,
            ..Default::default()
        };
        let options = settings.connect_options();

        assert_eq!(options.connect_timeout, Duration::from_millis(500));
        assert_eq!(options.attempts, 3);
        assert_eq!(options.send_queue_frames, 1);
    }
}
