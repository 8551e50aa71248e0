use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{self, BUILTIN_CHANNELS, SCHEMA_VERSION};
use crate::error::ReelError;
use crate::store::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "Ver")]
    pub version: String,
    #[serde(rename = "Max_Threads")]
    pub max_threads: usize,
    #[serde(rename = "Check_Cert")]
    pub check_cert: bool,
    #[serde(rename = "Custom_Download_Path")]
    pub custom_download_path: Utf8PathBuf,
    #[serde(rename = "Xpv_Pic_Download_RelativePath")]
    pub xpv_pic_relative_path: String,
    #[serde(rename = "Favor")]
    pub favorites: BTreeMap<String, Vec<String>>,
    #[serde(rename = "Proxy", default)]
    pub proxy: String,
    #[serde(rename = "Browser_Path", default)]
    pub browser_path: String,
    #[serde(rename = "Iwara_Token", default)]
    pub iwara_token: Option<String>,
    /// Per-channel hostnames and download roots, plus keys this version does not know.
    #[serde(flatten)]
    pub channel_keys: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = config::home_dir();
        let mut favorites = BTreeMap::new();
        let mut channel_keys = BTreeMap::new();
        for channel in BUILTIN_CHANNELS {
            favorites.insert(channel.name.to_lowercase(), Vec::new());
            channel_keys.insert(
                channel.hostname_key.to_string(),
                Value::String(channel.default_hostname.to_string()),
            );
            channel_keys.insert(
                channel.download_path_key.to_string(),
                Value::String(home.join(channel.default_download_dir).into_string()),
            );
            if let Some((key, value)) = channel.api_hostname {
                channel_keys.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        Self {
            version: SCHEMA_VERSION.to_string(),
            max_threads: 8,
            check_cert: true,
            custom_download_path: home.join("Custom_Downloads"),
            xpv_pic_relative_path: "#Pics".to_string(),
            favorites,
            proxy: String::new(),
            browser_path: String::new(),
            iwara_token: None,
            channel_keys,
        }
    }
}

impl Settings {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.channel_keys.get(key).and_then(Value::as_str)
    }

    pub fn hostname(&self, key: &str) -> String {
        self.get_str(key)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    pub fn download_root(&self, key: &str) -> Utf8PathBuf {
        self.get_str(key)
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| self.custom_download_path.clone())
    }

    pub fn favorites_for(&self, channel: &str) -> Vec<String> {
        self.favorites
            .get(&channel.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn saved_token(&self) -> Option<&str> {
        self.iwara_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
    }

    pub fn worker_count(&self) -> usize {
        self.max_threads.max(1)
    }

    /// Sets one top-level key. The value is read as JSON when it parses,
    /// otherwise as a plain string.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<(), ReelError> {
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let mut map = self.to_map()?;
        map.insert(key.to_string(), value);
        *self = Self::from_map(map)?;
        Ok(())
    }

    pub fn strip_hostname_slashes(&mut self) {
        for (key, value) in self.channel_keys.iter_mut() {
            if !key.ends_with("_Hostname") {
                continue;
            }
            if let Value::String(host) = value {
                let trimmed = host.trim_end_matches('/');
                if trimmed.len() != host.len() {
                    *host = trimmed.to_string();
                }
            }
        }
    }

    fn to_map(&self) -> Result<Map<String, Value>, ReelError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ReelError::SettingsParse("settings are not an object".to_string())),
            Err(err) => Err(ReelError::SettingsParse(err.to_string())),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, ReelError> {
        serde_json::from_value(Value::Object(map))
            .map_err(|err| ReelError::SettingsParse(err.to_string()))
    }

    /// Parses a settings file body, filling every key missing from the file
    /// with its default. Existing keys, known or not, are kept.
    pub fn from_json_with_defaults(content: &str) -> Result<Self, ReelError> {
        let raw: Value =
            serde_json::from_str(content).map_err(|err| ReelError::SettingsParse(err.to_string()))?;
        let Value::Object(mut map) = raw else {
            return Err(ReelError::SettingsParse(
                "settings file must hold a JSON object".to_string(),
            ));
        };
        for (key, value) in Settings::default().to_map()? {
            map.entry(key).or_insert(value);
        }
        Self::from_map(map)
    }
}

pub struct SettingsStore {
    path: Utf8PathBuf,
    current: RwLock<Settings>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Loads the settings file. A missing or malformed file falls back to
    /// defaults, which are written back immediately.
    pub fn load(path: Utf8PathBuf) -> Result<Self, ReelError> {
        info!(path = %path, "loading settings");
        let loaded = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => match Settings::from_json_with_defaults(&content) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    warn!(error = %err, "settings file is malformed, using defaults");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("settings file not found, using defaults");
                None
            }
            Err(err) => {
                warn!(error = %err, "settings file unreadable");
                return Err(ReelError::SettingsRead(path));
            }
        };

        let store = Self::with_settings(path, loaded.unwrap_or_default());
        if let Err(err) = store.save() {
            warn!(error = %err, "failed to write settings");
        }
        Ok(store)
    }

    pub fn with_settings(path: Utf8PathBuf, settings: Settings) -> Self {
        Self {
            path,
            current: RwLock::new(settings),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `change` and rewrites the whole file before returning.
    pub fn update<F>(&self, change: F) -> Result<(), ReelError>
    where
        F: FnOnce(&mut Settings) -> Result<(), ReelError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            change(&mut current)?;
            current.strip_hostname_slashes();
            current.clone()
        };
        self.write(&snapshot)
    }

    pub fn save(&self) -> Result<(), ReelError> {
        self.update(|_| Ok(()))
    }

    fn write(&self, settings: &Settings) -> Result<(), ReelError> {
        write_json_atomic(&self.path, settings)?;
        info!(path = %self.path, "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_builtin_channels() {
        let settings = Settings::default();
        assert_eq!(settings.hostname("Xpv_Hostname"), "https://www.xpicvid.com");
        assert_eq!(settings.hostname("Iwara_API_Hostname"), "https://api.iwara.tv");
        assert!(settings.download_root("Hanime1_Download_Path").ends_with("Hanime1_Downloads"));
        assert_eq!(settings.favorites_for("Xpv"), Vec::<String>::new());
    }

    #[test]
    fn set_value_reads_json_then_string() {
        let mut settings = Settings::default();
        settings.set_value("Max_Threads", "3").unwrap();
        settings.set_value("Xpv_Hostname", "https://mirror.example").unwrap();
        assert_eq!(settings.max_threads, 3);
        assert_eq!(settings.hostname("Xpv_Hostname"), "https://mirror.example");
    }

    #[test]
    fn blank_token_is_not_saved_token() {
        let mut settings = Settings::default();
        assert_eq!(settings.saved_token(), None);
        settings.set_value("Iwara_Token", " ").unwrap();
        assert_eq!(settings.saved_token(), None);
        settings.set_value("Iwara_Token", "abc").unwrap();
        assert_eq!(settings.saved_token(), Some("abc"));
        settings.set_value("Iwara_Token", "null").unwrap();
        assert_eq!(settings.iwara_token, None);
    }

    #[test]
    fn set_value_rejects_wrong_type() {
        let mut settings = Settings::default();
        assert!(settings.set_value("Check_Cert", "\"yes\"").is_err());
        assert!(settings.check_cert);
    }
}
