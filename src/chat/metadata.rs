use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Location is only attached to questions about the weather.
const WEATHER_KEYWORDS: &[&str] = &[
    "weather",
    "temperature",
    "forecast",
    "rain",
    "humidity",
    "climate",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Side information sent with a question. Anything that could not be
/// obtained is left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub local_time: Option<String>,
    pub timezone: Option<String>,
    pub battery_percent: Option<u8>,
    pub location: Option<GeoPoint>,
}

impl DeviceMetadata {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(time) = &self.local_time {
            fields.push(("localTime", time.clone()));
        }
        if let Some(tz) = &self.timezone {
            fields.push(("timezone", tz.clone()));
        }
        if let Some(battery) = self.battery_percent {
            fields.push(("battery", battery.to_string()));
        }
        if let Some(point) = self.location {
            fields.push(("latitude", point.latitude.to_string()));
            fields.push(("longitude", point.longitude.to_string()));
        }
        fields
    }
}

/// Sources of device metadata. Every method may give up by returning `None`.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn local_time(&self) -> Option<String>;
    async fn timezone(&self) -> Option<String>;
    async fn battery_percent(&self) -> Option<u8>;
    async fn location(&self) -> Option<GeoPoint>;
}

/// Reads the host clock, the `TZ` variable, a sysfs battery capacity file
/// and a configured location.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    battery_path: PathBuf,
    location: Option<GeoPoint>,
}

impl SystemProbe {
    pub fn new(battery_path: impl Into<PathBuf>, location: Option<GeoPoint>) -> Self {
        Self {
            battery_path: battery_path.into(),
            location,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new("/sys/class/power_supply/BAT0/capacity", None)
    }
}

#[async_trait]
impl DeviceProbe for SystemProbe {
    async fn local_time(&self) -> Option<String> {
        Some(Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
    }

    async fn timezone(&self) -> Option<String> {
        match std::env::var("TZ") {
            Ok(tz) if !tz.trim().is_empty() => Some(tz),
            _ => Some(format!("UTC{}", Local::now().format("%:z"))),
        }
    }

    async fn battery_percent(&self) -> Option<u8> {
        let raw = tokio::fs::read_to_string(&self.battery_path).await.ok()?;
        raw.trim().parse::<u8>().ok().filter(|pct| *pct <= 100)
    }

    async fn location(&self) -> Option<GeoPoint> {
        self.location
    }
}

pub fn mentions_weather(query: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| WEATHER_KEYWORDS.contains(&word.to_lowercase().as_str()))
}

async fn best_effort<T, F>(name: &'static str, limit: Duration, probe: F) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    match tokio::time::timeout(limit, probe).await {
        Ok(Some(value)) => Some(value),
        Ok(None) => {
            debug!(probe = name, "device metadata unavailable");
            None
        }
        Err(_) => {
            debug!(probe = name, ?limit, "device metadata probe timed out");
            None
        }
    }
}

/// Run every probe concurrently, each under its own timeout. Never fails.
pub async fn collect(probe: &dyn DeviceProbe, query: &str, limit: Duration) -> DeviceMetadata {
    let wants_location = mentions_weather(query);
    let (local_time, timezone, battery_percent, location) = tokio::join!(
        best_effort("local_time", limit, probe.local_time()),
        best_effort("timezone", limit, probe.timezone()),
        best_effort("battery", limit, probe.battery_percent()),
        async {
            if wants_location {
                best_effort("location", limit, probe.location()).await
            } else {
                None
            }
        },
    );

    DeviceMetadata {
        local_time,
        timezone,
        battery_percent,
        location,
    }
}
