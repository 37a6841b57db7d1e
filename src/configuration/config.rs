#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::env;
use std::path;

use anyhow::Result;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use strum::EnumIter;
use strum::IntoEnumIterator;
use tokio::fs;

static CONFIG: Lazy<DashMap<String, String>> = Lazy::new(DashMap::new);

#[derive(Clone, Copy, Eq, PartialEq, EnumIter, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConfigKey {
    BackendHealthCheckTimeout,
    ConfigFile,
    Model,
    OllamaURL,
    RemoteDirectory,
    RemoteEnabled,
    RemoteURL,
    StateDir,
    Username,
}

pub struct Config {}

impl Config {
    pub fn get(key: ConfigKey) -> String {
        if let Some(val) = CONFIG.get(&key.to_string()) {
            return val.to_string();
        }

        return Config::default(key);
    }

    pub fn set(key: ConfigKey, value: &str) {
        CONFIG.insert(key.to_string(), value.to_string());
    }

    pub fn default(key: ConfigKey) -> String {
        if key == ConfigKey::Username {
            let mut user = env::var("USER").unwrap_or_else(|_| return "".to_string());
            if user.is_empty() {
                user = "User".to_string();
            }

            return user;
        }

        let home = dirs::home_dir().unwrap_or_else(|| return path::PathBuf::from("."));
        let state_dir = dirs::data_dir()
            .unwrap_or_else(|| return home.join(".local/share"))
            .join("confab");
        let config_path = state_dir.join("config.toml");

        let res = match key {
            ConfigKey::BackendHealthCheckTimeout => "1000".to_string(),
            ConfigKey::Model => "llama3".to_string(),
            ConfigKey::OllamaURL => "http://localhost:11434".to_string(),
            ConfigKey::RemoteDirectory => home.join(".confab/workspace").to_string_lossy().to_string(),
            ConfigKey::RemoteEnabled => "true".to_string(),
            ConfigKey::RemoteURL => "http://127.0.0.1:6096".to_string(),
            ConfigKey::StateDir => state_dir.to_string_lossy().to_string(),

            // Special
            ConfigKey::ConfigFile => config_path.to_string_lossy().to_string(),
            ConfigKey::Username => "".to_string(),
        };

        return res;
    }

    /// Loads configuration from a toml file, falling back to defaults for any
    /// key the file does not set. A missing file is not an error.
    pub async fn load(config_file: Option<&str>) -> Result<()> {
        for key in ConfigKey::iter() {
            Config::set(key, &Config::default(key));
        }

        let file = config_file
            .map(|e| return e.to_string())
            .unwrap_or_else(|| return Config::default(ConfigKey::ConfigFile));

        let config_path = path::PathBuf::from(&file);
        if config_path.exists() {
            Config::set(ConfigKey::ConfigFile, &file);
            let toml_str = fs::read_to_string(config_path).await?;
            let doc = toml_str.parse::<toml_edit::Document>()?;

            for key in ConfigKey::iter() {
                if let Some(val) = doc.get(&key.to_string()) {
                    if let Some(val_int) = val.as_integer() {
                        Config::set(key, &val_int.to_string());
                    } else if let Some(val_bool) = val.as_bool() {
                        Config::set(key, &val_bool.to_string());
                    } else if let Some(val_str) = val.as_str() {
                        if val_str.is_empty() {
                            continue;
                        }
                        Config::set(key, val_str);
                    }
                }
            }
        }

        tracing::debug!(
            username = Config::get(ConfigKey::Username),
            model = Config::get(ConfigKey::Model),
            remote_url = Config::get(ConfigKey::RemoteURL),
            remote_enabled = Config::get(ConfigKey::RemoteEnabled),
            "config"
        );

        return Ok(());
    }
}
