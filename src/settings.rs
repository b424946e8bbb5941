use config::{Config, File as ConfigFile};
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

use crate::discovery::classifier::BoundDevices;
use crate::errors::AppError;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DeviceSettings {
    // Empty means nothing is bound
    pub rower_address: String,
    pub heart_rate_address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DiscoverySettings {
    pub timeout_secs: u64,
    pub sample_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ConnectionSettings {
    /// How long to look for the device before counting an attempt as failed
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub rower_retry_count: u32,
    pub rower_retry_delay_ms: u64,
    // 0 keeps retrying until cancelled
    pub heart_rate_retry_count: u32,
    pub heart_rate_retry_delay_secs: u64,
    pub no_packet_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SmoothingSettings {
    pub window: usize,
    pub heart_rate_window: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SessionSettings {
    pub countdown_secs: u32,
    pub tick_ms: u64,
    /// Seconds left in a timed segment when countdown alerts start
    pub alert_countdown_secs: u32,
    /// Seconds left in a timed segment when the next one is announced
    pub preview_secs: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DummySettings {
    // When enabled, BLE sources are replaced with generated data
    pub enabled: bool,
    pub pace_secs: f64,
    pub stroke_rate: f64,
    pub low_bpm: u16,
    pub high_bpm: u16,
    pub bpm_speed: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MiscSettings {
    log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    pub devices: DeviceSettings,
    pub discovery: DiscoverySettings,
    pub connection: ConnectionSettings,
    pub smoothing: SmoothingSettings,
    pub session: SessionSettings,
    pub dummy: DummySettings,
    pub misc: MiscSettings,
}

impl Settings {
    /// Loads settings from `config_path` (if given) on top of the defaults.
    pub fn load(config_path: Option<&Path>, required: bool) -> Result<Self, AppError> {
        let default_log_level = if cfg!(debug_assertions) {
            "debug"
        } else {
            "info"
        };

        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(ConfigFile::from(path).required(required));
        }

        let s = builder
            .set_default("devices.rower_address", "")?
            .set_default("devices.heart_rate_address", "")?
            .set_default("discovery.timeout_secs", 15)?
            .set_default("discovery.sample_interval_ms", 500)?
            .set_default("connection.scan_timeout_secs", 15)?
            .set_default("connection.connect_timeout_secs", 10)?
            .set_default("connection.rower_retry_count", 3)?
            .set_default("connection.rower_retry_delay_ms", 1000)?
            .set_default("connection.heart_rate_retry_count", 0)?
            .set_default("connection.heart_rate_retry_delay_secs", 5)?
            .set_default("connection.no_packet_timeout_secs", 30)?
            .set_default("smoothing.window", 3)?
            .set_default("smoothing.heart_rate_window", 3)?
            .set_default("session.countdown_secs", 3)?
            .set_default("session.tick_ms", 1000)?
            .set_default("session.alert_countdown_secs", 5)?
            .set_default("session.preview_secs", 10)?
            .set_default("dummy.enabled", false)?
            .set_default("dummy.pace_secs", 125.0)?
            .set_default("dummy.stroke_rate", 22.0)?
            .set_default("dummy.low_bpm", 50)?
            .set_default("dummy.high_bpm", 120)?
            .set_default("dummy.bpm_speed", 1.5)?
            .set_default("misc.log_level", default_log_level)?
            .build()?;

        Ok(s.try_deserialize()?)
    }
    pub fn save(&self, config_path: &Path) -> Result<(), AppError> {
        let toml_string = toml::to_string(self)?;

        let mut file = File::create(config_path).map_err(|e| AppError::CreateFile {
            path: config_path.to_owned(),
            source: e,
        })?;
        file.write_all(toml_string.as_bytes())?;
        file.sync_all()?;

        Ok(())
    }
    /// Platform config location, `None` if the OS doesn't report a home directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
            .map(|dirs| dirs.config_dir().join("settings.toml"))
    }
    pub fn bound_devices(&self) -> BoundDevices {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.trim().to_owned());
        BoundDevices {
            rower: non_empty(&self.devices.rower_address),
            heart_rate: non_empty(&self.devices.heart_rate_address),
        }
    }
    pub fn set_bound_devices(&mut self, bound: &BoundDevices) {
        self.devices.rower_address = bound.rower.clone().unwrap_or_default();
        self.devices.heart_rate_address = bound.heart_rate.clone().unwrap_or_default();
    }
    pub fn log_level(&self) -> LevelFilter {
        match self.misc.log_level.to_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        }
    }
}

impl DiscoverySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn sample_interval(&self) -> Duration {
        // Interval panics on a zero period
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

impl ConnectionSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn no_packet_timeout(&self) -> Duration {
        Duration::from_secs(self.no_packet_timeout_secs)
    }
}

impl SessionSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
