use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ApiConfig;
use crate::chat::GeoPoint;
use crate::db::Database;
use crate::error::{Result, WorkflowError};

const SETTING_KEYS: &[&str] = &[
    "api_base_url",
    "api_token",
    "request_timeout_secs",
    "metadata_timeout_ms",
    "latitude",
    "longitude",
    "battery_path",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    pub metadata_timeout_ms: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub battery_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            api_token: None,
            request_timeout_secs: 30,
            metadata_timeout_ms: 500,
            latitude: None,
            longitude: None,
            battery_path: "/sys/class/power_supply/BAT0/capacity".to_string(),
        }
    }
}

fn parsed<T: FromStr>(db: &Database, key: &str) -> Result<Option<T>> {
    let Some(raw) = db.get_setting(key)? else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(value) => Ok(Some(value)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            Ok(None)
        }
    }
}

impl Settings {
    /// Stored settings over defaults. Values that do not parse fall back to
    /// the default.
    pub fn load(db: &Database) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_base_url: db.get_setting("api_base_url")?.unwrap_or(defaults.api_base_url),
            api_token: db.get_setting("api_token")?.filter(|t| !t.is_empty()),
            request_timeout_secs: parsed(db, "request_timeout_secs")?
                .unwrap_or(defaults.request_timeout_secs),
            metadata_timeout_ms: parsed(db, "metadata_timeout_ms")?
                .unwrap_or(defaults.metadata_timeout_ms),
            latitude: parsed(db, "latitude")?,
            longitude: parsed(db, "longitude")?,
            battery_path: db.get_setting("battery_path")?.unwrap_or(defaults.battery_path),
        })
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_base_url.clone(),
            token: self.api_token.clone(),
            timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn battery_path(&self) -> PathBuf {
        PathBuf::from(&self.battery_path)
    }

    pub fn location(&self) -> Option<GeoPoint> {
        Some(GeoPoint {
            latitude: self.latitude?,
            longitude: self.longitude?,
        })
    }
}

/// Stored settings for display, with the API token masked.
pub fn get_settings(db: &Database) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            if key.ends_with("_token") && value.chars().count() > 8 {
                let chars: Vec<char> = value.chars().collect();
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                map.insert(key.to_string(), format!("{}...{}", head, tail));
            } else {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(map)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<()> {
    if !SETTING_KEYS.contains(&key) {
        return Err(WorkflowError::validation(format!("Unknown setting key: {}", key)));
    }
    db.set_setting(key, value)?;
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<()> {
    if !SETTING_KEYS.contains(&key) {
        return Err(WorkflowError::validation(format!("Unknown setting key: {}", key)));
    }
    db.delete_setting(key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_and_overrides() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(Settings::load(&db).unwrap(), Settings::default());

        set_setting(&db, "api_base_url", "https://cora.example.edu/api").unwrap();
        set_setting(&db, "request_timeout_secs", "12").unwrap();
        set_setting(&db, "metadata_timeout_ms", "not a number").unwrap();
        set_setting(&db, "latitude", "14.6").unwrap();

        let settings = Settings::load(&db).unwrap();
        assert_eq!(settings.api_base_url, "https://cora.example.edu/api");
        assert_eq!(settings.request_timeout_secs, 12);
        assert_eq!(settings.metadata_timeout_ms, 500);
        assert_eq!(settings.location(), None);

        set_setting(&db, "longitude", "121.0").unwrap();
        assert_eq!(
            Settings::load(&db).unwrap().location(),
            Some(GeoPoint {
                latitude: 14.6,
                longitude: 121.0
            })
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            set_setting(&db, "theme", "dark"),
            Err(WorkflowError::Validation(_))
        ));
        assert!(matches!(
            delete_setting(&db, "theme"),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_token_masked_for_display() {
        let db = Database::open_in_memory().unwrap();
        set_setting(&db, "api_token", "abcd1234efgh5678").unwrap();
        set_setting(&db, "api_base_url", "http://cora.local").unwrap();

        let shown = get_settings(&db).unwrap();
        assert_eq!(shown["api_token"], "abcd...5678");
        assert_eq!(shown["api_base_url"], "http://cora.local");
    }
}
