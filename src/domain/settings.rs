use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "HeartLink";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "heart_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How long one scan runs before it is stopped automatically
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    /// Quiet period after which the discovery registry is emptied
    #[serde(default = "default_registry_reset_secs")]
    pub registry_reset_secs: u64,
    /// Key/value file holding the remembered peripheral, relative to the config dir
    #[serde(default = "default_store_file")]
    pub store_file: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_duration_secs: default_scan_duration_secs(),
            registry_reset_secs: default_registry_reset_secs(),
            store_file: default_store_file(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn registry_reset(&self) -> Duration {
        Duration::from_secs(self.registry_reset_secs)
    }
}

fn default_scan_duration_secs() -> u64 {
    45
}
fn default_registry_reset_secs() -> u64 {
    5 * 60
}
fn default_store_file() -> String {
    "prefs.json".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::config_dir()?.join(SETTINGS_FILE);
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({:?}): {}", settings_path, e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    /// Per-user configuration directory, created on demand.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.scan_duration(), Duration::from_secs(45));
        assert_eq!(settings.registry_reset(), Duration::from_secs(300));
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_partial_json_uses_field_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"scan_duration_secs": 10}"#).unwrap();
        assert_eq!(settings.scan_duration_secs, 10);
        assert_eq!(settings.registry_reset_secs, 300);
        assert_eq!(settings.store_file, "prefs.json");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().scan_duration_secs = 12;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().scan_duration_secs, 12);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path);
        assert_eq!(service.get().scan_duration_secs, 45);
    }
}
