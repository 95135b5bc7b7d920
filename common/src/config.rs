use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_MANIFEST_PATH: &str = "update_manifest.json";
pub const DEFAULT_ENTRY_FILE: &str = "main.py";
pub const DEFAULT_UPDATER_FILE: &str = "updates.py";
pub const DEFAULT_AP_SSID: &str = "GroundBoardBA-Setup";
pub const DEFAULT_AP_PASSWORD: &str = "configureme";
pub const DEFAULT_NTP_HOST: &str = "pool.ntp.org";

/// The persisted key/value document, typed.
///
/// Keys owned by other parts of the firmware (LED pins, runway headings,
/// button wiring) land in `extra` and are written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    #[serde(rename = "WIFI_SSID")]
    pub wifi_ssid: String,
    #[serde(rename = "WIFI_PASSWORD")]
    pub wifi_password: String,
    #[serde(rename = "MAX_WIFI_WAIT")]
    pub max_wifi_wait_s: u32,

    #[serde(rename = "WIFI_AP_SSID")]
    pub ap_ssid: String,
    #[serde(rename = "WIFI_AP_PASSWORD")]
    pub ap_password: String,
    #[serde(rename = "WIFI_WAIT_AFTER_SUBMIT_S")]
    pub wait_after_submit_s: u32,

    #[serde(rename = "NTP_HOST")]
    pub ntp_host: String,
    #[serde(rename = "NTP_RETRIES")]
    pub ntp_retries: u32,

    #[serde(rename = "GITHUB_REPO")]
    pub github_repo: Option<String>,
    #[serde(rename = "GITHUB_BRANCH")]
    pub github_branch: String,
    #[serde(rename = "GITHUB_SUBDIR")]
    pub github_subdir: String,
    #[serde(rename = "UPDATE_MANIFEST_PATH")]
    pub manifest_path: String,
    #[serde(rename = "UPDATE_FILE_EXTENSIONS")]
    pub file_extensions: Vec<String>,
    #[serde(rename = "UPDATE_PRESERVE_FILES")]
    pub preserve_files: Vec<String>,
    #[serde(rename = "UPDATE_ENTRY_FILE")]
    pub entry_file: String,
    #[serde(rename = "UPDATE_SELF_FILE")]
    pub updater_file: String,
    #[serde(rename = "UPDATE_MODE")]
    pub update_mode: bool,

    #[serde(
        rename = "LED_BRIGHTNESS",
        deserialize_with = "percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub led_brightness: Option<u8>,
    #[serde(
        rename = "CROSSWIND_THRESHOLD_KTS",
        deserialize_with = "percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub crosswind_threshold_kts: Option<u8>,

    #[serde(rename = "METAR_STATION_ID", skip_serializing_if = "Option::is_none")]
    pub metar_station_id: Option<String>,
    #[serde(rename = "METAR_SOCKET_TIMEOUT_S")]
    pub metar_timeout_s: u32,
    #[serde(rename = "METAR_FETCH_RETRIES")]
    pub metar_retries: u32,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            max_wifi_wait_s: 30,
            ap_ssid: DEFAULT_AP_SSID.to_string(),
            ap_password: DEFAULT_AP_PASSWORD.to_string(),
            wait_after_submit_s: 2,
            ntp_host: DEFAULT_NTP_HOST.to_string(),
            ntp_retries: 3,
            github_repo: None,
            github_branch: DEFAULT_BRANCH.to_string(),
            github_subdir: String::new(),
            manifest_path: DEFAULT_MANIFEST_PATH.to_string(),
            file_extensions: vec![".py".to_string(), ".json".to_string()],
            preserve_files: vec!["config.json".to_string()],
            entry_file: DEFAULT_ENTRY_FILE.to_string(),
            updater_file: DEFAULT_UPDATER_FILE.to_string(),
            update_mode: false,
            led_brightness: None,
            crosswind_threshold_kts: None,
            metar_station_id: None,
            metar_timeout_s: 10,
            metar_retries: 3,
            extra: Map::new(),
        }
    }
}

/// What the connection manager needs out of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    pub max_wait: Duration,
    pub ntp_host: String,
    pub ntp_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub password: String,
    pub linger: Duration,
}

/// Any JSON number, clamped to 0..=100.
fn percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(|number| number.clamp(0.0, 100.0).round() as u8))
}

impl BoardConfig {
    /// Parses a stored document. A known key whose value has the wrong type
    /// (or is null) falls back to its default instead of failing the load.
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut doc: Map<String, Value> = serde_json::from_slice(raw)?;
        let unusable: Vec<String> = doc
            .iter()
            .filter(|(key, value)| !Self::accepts(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in unusable {
            warn!("config key {key} has an unusable value; using the default");
            doc.remove(&key);
        }
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    fn accepts(key: &str, value: &Value) -> bool {
        let mut single = Map::new();
        single.insert(key.to_string(), value.clone());
        serde_json::from_value::<Self>(Value::Object(single)).is_ok()
    }

    pub fn sanitize(&mut self) {
        self.max_wifi_wait_s = self.max_wifi_wait_s.clamp(1, 600);
        self.ntp_retries = self.ntp_retries.clamp(1, 10);
        self.metar_retries = self.metar_retries.clamp(1, 10);
        self.metar_timeout_s = self.metar_timeout_s.clamp(1, 120);
        self.led_brightness = self.led_brightness.map(|value| value.min(100));
        self.crosswind_threshold_kts = self.crosswind_threshold_kts.map(|value| value.min(100));

        if self.github_branch.trim().is_empty() {
            self.github_branch = DEFAULT_BRANCH.to_string();
        }
        if self.manifest_path.trim().is_empty() {
            self.manifest_path = DEFAULT_MANIFEST_PATH.to_string();
        }
        if self.entry_file.trim().is_empty() {
            self.entry_file = DEFAULT_ENTRY_FILE.to_string();
        }
        if self.updater_file.trim().is_empty() {
            self.updater_file = DEFAULT_UPDATER_FILE.to_string();
        }
        if self.ap_ssid.trim().is_empty() {
            self.ap_ssid = DEFAULT_AP_SSID.to_string();
        }
        // WPA2 needs at least 8 characters.
        if self.ap_password.len() < 8 {
            self.ap_password = DEFAULT_AP_PASSWORD.to_string();
        }
        if self.ntp_host.trim().is_empty() {
            self.ntp_host = DEFAULT_NTP_HOST.to_string();
        }
    }

    pub fn wifi_settings(&self) -> WifiSettings {
        WifiSettings {
            ssid: self.wifi_ssid.clone(),
            password: self.wifi_password.clone(),
            max_wait: Duration::from_secs(u64::from(self.max_wifi_wait_s)),
            ntp_host: self.ntp_host.clone(),
            ntp_retries: self.ntp_retries,
        }
    }

    pub fn access_point_settings(&self) -> AccessPointSettings {
        AccessPointSettings {
            ssid: self.ap_ssid.clone(),
            password: self.ap_password.clone(),
            linger: Duration::from_secs(u64::from(self.wait_after_submit_s)),
        }
    }
}

/// Backing storage for [`BoardConfig`].
pub trait ConfigStore {
    fn load(&self) -> Result<BoardConfig, ConfigError>;

    fn save(&self, config: &BoardConfig) -> Result<(), ConfigError>;

    /// Read-modify-write of the whole document.
    fn update<F>(&self, apply: F) -> Result<BoardConfig, ConfigError>
    where
        F: FnOnce(&mut BoardConfig),
        Self: Sized,
    {
        let mut config = self.load()?;
        apply(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<BoardConfig, ConfigError> {
        match std::fs::read(&self.path) {
            Ok(raw) => BoardConfig::from_json(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BoardConfig::default()),
            Err(err) => Err(ConfigError::Read(err)),
        }
    }

    fn save(&self, config: &BoardConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(ConfigError::Write)?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        std::fs::write(&self.path, payload).map_err(ConfigError::Write)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_keys_survive_a_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "WIFI_SSID": "hangar",
                "RUNWAY_HEADINGS": [160, 340],
                "BUTTON_PIN_AP": 15
            }))
            .unwrap(),
        )
        .unwrap();

        let store = JsonFileStore::new(&path);
        let saved = store.update(|cfg| cfg.update_mode = true).unwrap();
        assert_eq!(saved.wifi_ssid, "hangar");

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["RUNWAY_HEADINGS"], json!([160, 340]));
        assert_eq!(raw["BUTTON_PIN_AP"], json!(15));
        assert_eq!(raw["UPDATE_MODE"], json!(true));
    }

    #[test]
    fn mistyped_values_fall_back_to_defaults_key_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = JsonFileStore::new(&path);

        std::fs::write(&path, br#"{"GITHUB_SUBDIR": null, "WIFI_SSID": "hangar"}"#).unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.github_subdir, "");
        assert_eq!(config.wifi_ssid, "hangar");

        std::fs::write(&path, br#"{"UPDATE_FILE_EXTENSIONS": ".py", "MAX_WIFI_WAIT": 45}"#).unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.file_extensions, vec![".py", ".json"]);
        assert_eq!(config.max_wifi_wait_s, 45);

        std::fs::write(&path, br#"{"LED_BRIGHTNESS": 300, "CROSSWIND_THRESHOLD_KTS": -4}"#).unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.led_brightness, Some(100));
        assert_eq!(config.crosswind_threshold_kts, Some(0));

        std::fs::write(&path, br#"{"MAX_WIFI_WAIT": "soon", "LED_BRIGHTNESS": "dim", "PINS": null}"#)
            .unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.max_wifi_wait_s, 30);
        assert_eq!(config.led_brightness, None);
        assert_eq!(config.extra.get("PINS"), Some(&Value::Null));
    }

    #[test]
    fn documents_that_are_not_objects_still_fail() {
        assert!(matches!(
            BoardConfig::from_json(b"[1, 2]"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BoardConfig::from_json(b"{\"WIFI_SSID\":"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/config.json"));
        let config = store.load().unwrap();
        assert_eq!(config, BoardConfig::default());

        store.save(&config).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn sanitize_restores_defaults_for_blank_values() {
        let mut config = BoardConfig {
            github_branch: " ".to_string(),
            ap_password: "short".to_string(),
            max_wifi_wait_s: 0,
            led_brightness: Some(250),
            ..BoardConfig::default()
        };
        config.sanitize();

        assert_eq!(config.github_branch, DEFAULT_BRANCH);
        assert_eq!(config.ap_password, DEFAULT_AP_PASSWORD);
        assert_eq!(config.max_wifi_wait_s, 1);
        assert_eq!(config.led_brightness, Some(100));
    }
}
