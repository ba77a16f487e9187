//! Configuration management for the voice mesh
//!
//! Settings live in `<config_dir>/voice_mesh/config.toml`. Any field can
//! be overridden from the environment with a `VOICE_MESH_` prefix, e.g.
//! `VOICE_MESH_USERNAME=ada`.

use config::{Config, Environment, File, FileFormat, Map};
use log::debug;
use room_core::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "VOICE_MESH";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// User's display name
    pub username: String,

    /// Preferred audio input device (empty string means system default)
    pub audio_input_device: String,

    /// STUN servers used for path discovery
    pub ice_servers: Vec<String>,

    /// Gather mDNS host candidates
    pub enable_mdns: bool,

    /// Capacity of every event queue
    pub event_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            audio_input_device: "".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            enable_mdns: false,
            event_queue_capacity: 100,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load settings from the user's config directory, falling back to
    /// defaults when no file exists
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push("voice_mesh");

        Self::with_file(config_dir.join("config.toml"))
    }

    /// Create a ConfigManager backed by a specific file
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let settings = Self::load(&config_file, None)?;

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Layer defaults, the file (if present) and the environment.
    /// `env` replaces the process environment when given.
    fn load(path: &Path, env: Option<Map<String, String>>) -> Result<Settings, Error> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
        }

        let defaults = Config::try_from(&Settings::default())
            .map_err(|e| Error::Config(format!("Failed to build default settings: {}", e)))?;

        Config::builder()
            .add_source(defaults)
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers")
                    .source(env),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| Error::Config(format!("Failed to load settings: {}", e)))
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.username, "Anonymous");
        assert_eq!(settings.audio_input_device, "");
        assert_eq!(settings.ice_servers.len(), 1);
        assert!(!settings.enable_mdns);
        assert_eq!(settings.event_queue_capacity, 100);
    }

    #[test]
    fn save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("test_config.toml");

        let mut config = ConfigManager::with_file(&config_path).unwrap();
        config.settings_mut().username = "TestUser".to_string();
        config.settings_mut().audio_input_device = "TestMic".to_string();
        config.settings_mut().ice_servers = vec!["stun:stun.example.org:3478".to_string()];
        config.save().unwrap();
        assert!(config_path.exists());

        let loaded = ConfigManager::load(&config_path, env(&[])).unwrap();
        assert_eq!(loaded.username, "TestUser");
        assert_eq!(loaded.audio_input_device, "TestMic");
        assert_eq!(loaded.ice_servers, vec!["stun:stun.example.org:3478"]);
    }

    #[test]
    fn file_not_found_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let nonexistent_path = temp_dir.path().join("nonexistent.toml");

        let settings = ConfigManager::load(&nonexistent_path, env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        fs::write(&config_path, "username = \"Ada\"\n").unwrap();

        let settings = ConfigManager::load(&config_path, env(&[])).unwrap();
        assert_eq!(settings.username, "Ada");
        assert_eq!(settings.event_queue_capacity, 100);
    }

    #[test]
    fn environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "username = \"Ada\"\nevent_queue_capacity = 10\n").unwrap();

        let settings = ConfigManager::load(
            &config_path,
            env(&[
                ("VOICE_MESH_USERNAME", "Grace"),
                ("VOICE_MESH_ENABLE_MDNS", "true"),
                ("VOICE_MESH_ICE_SERVERS", "stun:a.example:3478,stun:b.example:3478"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.username, "Grace");
        assert!(settings.enable_mdns);
        assert_eq!(settings.event_queue_capacity, 10);
        assert_eq!(settings.ice_servers, vec!["stun:a.example:3478", "stun:b.example:3478"]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "username = [unterminated").unwrap();

        let result = ConfigManager::load(&config_path, env(&[]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
