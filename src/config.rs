// SoundWatch - Hardware & System Configuration
// Target: ESP32 + SM7901 RS-485 sound-level module (Modbus RTU)

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::events::SensorSite;

// ---------------------------------------------------------------------------
// GPIO Pin Definitions
// ---------------------------------------------------------------------------
pub const PIN_BUTTON: i32 = 5;      // Connectivity toggle (INPUT_PULLUP, active LOW)
pub const PIN_UART_TX: i32 = 8;     // RS-485 transceiver DI
pub const PIN_UART_RX: i32 = 9;     // RS-485 transceiver RO

// ---------------------------------------------------------------------------
// Field Bus (Modbus RTU over UART, 8N1)
// ---------------------------------------------------------------------------
pub const UART_BAUD_RATE: u32 = 9600;
pub const MODBUS_DEVICE_ADDRESS: u8 = 0x01;
pub const MODBUS_REGISTER_DECIBELS: u16 = 0x0000;
pub const MODBUS_REGISTER_COUNT: u16 = 1;
pub const MODBUS_RESPONSE_TIMEOUT_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Task Stack Sizes (bytes)
// ---------------------------------------------------------------------------
pub const STACK_ACQUISITION: usize = 8192;
pub const STACK_PUBLICATION: usize = 12288; // JSON encoding + file I/O
pub const STACK_RESOLVER: usize = 4096;

pub const READING_CHANNEL_DEPTH: usize = 16;
pub const SESSION_EVENT_DEPTH: usize = 4;

// ---------------------------------------------------------------------------
// Timing (milliseconds unless stated)
// ---------------------------------------------------------------------------
pub const ACQUISITION_INTERVAL_MS: u64 = 300;
pub const WINDOW_LENGTH_SECS: u64 = 60;
pub const DEBOUNCE_MS: u64 = 50;
pub const WIFI_RETRY_COOLDOWN_SECS: u64 = 60;
pub const WIFI_BOOT_CONNECT_TIMEOUT_MS: u64 = 8000;
pub const WIFI_BOOT_POLL_MS: u64 = 100;
pub const MQTT_CHECK_INTERVAL_MS: u64 = 5000;
pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
pub const DNS_TIMEOUT_MS: u64 = 15_000;
pub const TIME_SYNC_RETRIES: u32 = 20;
pub const TIME_SYNC_INTERVAL_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
pub const STORAGE_BASE_PATH: &str = "/storage";
#[cfg(not(target_os = "espidf"))]
pub const STORAGE_BASE_PATH: &str = "backlog";
pub const STORAGE_MAX_FILES: usize = 8;

// ---------------------------------------------------------------------------
// Deployment configuration
// ---------------------------------------------------------------------------

/// Deployment settings. Fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub broker_host: String,
    pub broker_port: u16,
    /// Used when the broker host name cannot be resolved in time.
    pub broker_fallback: IpAddr,
    pub client_id: String,
    pub topic: String,
    pub sensor_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Offset applied to UTC for payload timestamps.
    pub utc_offset_hours: i8,
    pub device_address: u8,
    pub register_address: u16,
    pub register_count: u16,
    pub window_length: Duration,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub storage_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            broker_host: "test.mosquitto.org".into(),
            broker_port: 1883,
            broker_fallback: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 24)),
            client_id: "Sensor1".into(),
            topic: "sensor/sound/soundwatch".into(),
            sensor_id: "1".into(),
            latitude: -3.743987,
            longitude: -38.536267,
            utc_offset_hours: -3,
            device_address: MODBUS_DEVICE_ADDRESS,
            register_address: MODBUS_REGISTER_DECIBELS,
            register_count: MODBUS_REGISTER_COUNT,
            window_length: Duration::from_secs(WINDOW_LENGTH_SECS),
            poll_interval: Duration::from_millis(ACQUISITION_INTERVAL_MS),
            debounce: Duration::from_millis(DEBOUNCE_MS),
            storage_path: PathBuf::from(STORAGE_BASE_PATH),
        }
    }
}

impl Config {
    /// Load the configuration for this build.
    ///
    /// Firmware images bake their settings in at compile time; host builds
    /// read the process environment (after loading `.env`, if present).
    #[cfg(target_os = "espidf")]
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| build_time_value(key).map(str::to_owned))
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `SOUNDWATCH_*` keys, falling back to the
    /// defaults for anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let window_secs = parse(&lookup, "SOUNDWATCH_WINDOW_SECS", d.window_length.as_secs())?;
        let poll_ms = parse(&lookup, "SOUNDWATCH_POLL_INTERVAL_MS", d.poll_interval.as_millis() as u64)?;
        let debounce_ms = parse(&lookup, "SOUNDWATCH_DEBOUNCE_MS", d.debounce.as_millis() as u64)?;
        if window_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SOUNDWATCH_WINDOW_SECS",
                value: window_secs.to_string(),
            });
        }

        let utc_offset_hours = parse(&lookup, "SOUNDWATCH_UTC_OFFSET_HOURS", d.utc_offset_hours)?;
        if !(-23..=23).contains(&utc_offset_hours) {
            return Err(ConfigError::Invalid {
                key: "SOUNDWATCH_UTC_OFFSET_HOURS",
                value: utc_offset_hours.to_string(),
            });
        }

        Ok(Self {
            wifi_ssid: lookup("SOUNDWATCH_WIFI_SSID").unwrap_or(d.wifi_ssid),
            wifi_password: lookup("SOUNDWATCH_WIFI_PASSWORD").unwrap_or(d.wifi_password),
            broker_host: lookup("SOUNDWATCH_BROKER_HOST").unwrap_or(d.broker_host),
            broker_port: parse(&lookup, "SOUNDWATCH_BROKER_PORT", d.broker_port)?,
            broker_fallback: parse(&lookup, "SOUNDWATCH_BROKER_FALLBACK", d.broker_fallback)?,
            client_id: lookup("SOUNDWATCH_CLIENT_ID").unwrap_or(d.client_id),
            topic: lookup("SOUNDWATCH_TOPIC").unwrap_or(d.topic),
            sensor_id: lookup("SOUNDWATCH_SENSOR_ID").unwrap_or(d.sensor_id),
            latitude: parse(&lookup, "SOUNDWATCH_LATITUDE", d.latitude)?,
            longitude: parse(&lookup, "SOUNDWATCH_LONGITUDE", d.longitude)?,
            utc_offset_hours,
            device_address: parse(&lookup, "SOUNDWATCH_MODBUS_ADDRESS", d.device_address)?,
            register_address: parse(&lookup, "SOUNDWATCH_MODBUS_REGISTER", d.register_address)?,
            register_count: parse(&lookup, "SOUNDWATCH_MODBUS_REGISTER_COUNT", d.register_count)?,
            window_length: Duration::from_secs(window_secs),
            poll_interval: Duration::from_millis(poll_ms),
            debounce: Duration::from_millis(debounce_ms),
            storage_path: lookup("SOUNDWATCH_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.storage_path),
        })
    }

    pub fn site(&self) -> SensorSite {
        SensorSite {
            sensor_id: self.sensor_id.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

/// Values baked in with `SOUNDWATCH_* = ... cargo build`.
#[cfg(target_os = "espidf")]
fn build_time_value(key: &str) -> Option<&'static str> {
    match key {
        "SOUNDWATCH_WIFI_SSID" => option_env!("SOUNDWATCH_WIFI_SSID"),
        "SOUNDWATCH_WIFI_PASSWORD" => option_env!("SOUNDWATCH_WIFI_PASSWORD"),
        "SOUNDWATCH_BROKER_HOST" => option_env!("SOUNDWATCH_BROKER_HOST"),
        "SOUNDWATCH_BROKER_PORT" => option_env!("SOUNDWATCH_BROKER_PORT"),
        "SOUNDWATCH_BROKER_FALLBACK" => option_env!("SOUNDWATCH_BROKER_FALLBACK"),
        "SOUNDWATCH_CLIENT_ID" => option_env!("SOUNDWATCH_CLIENT_ID"),
        "SOUNDWATCH_TOPIC" => option_env!("SOUNDWATCH_TOPIC"),
        "SOUNDWATCH_SENSOR_ID" => option_env!("SOUNDWATCH_SENSOR_ID"),
        "SOUNDWATCH_LATITUDE" => option_env!("SOUNDWATCH_LATITUDE"),
        "SOUNDWATCH_LONGITUDE" => option_env!("SOUNDWATCH_LONGITUDE"),
        "SOUNDWATCH_UTC_OFFSET_HOURS" => option_env!("SOUNDWATCH_UTC_OFFSET_HOURS"),
        "SOUNDWATCH_MODBUS_ADDRESS" => option_env!("SOUNDWATCH_MODBUS_ADDRESS"),
        "SOUNDWATCH_MODBUS_REGISTER" => option_env!("SOUNDWATCH_MODBUS_REGISTER"),
        "SOUNDWATCH_MODBUS_REGISTER_COUNT" => option_env!("SOUNDWATCH_MODBUS_REGISTER_COUNT"),
        "SOUNDWATCH_WINDOW_SECS" => option_env!("SOUNDWATCH_WINDOW_SECS"),
        "SOUNDWATCH_POLL_INTERVAL_MS" => option_env!("SOUNDWATCH_POLL_INTERVAL_MS"),
        "SOUNDWATCH_DEBOUNCE_MS" => option_env!("SOUNDWATCH_DEBOUNCE_MS"),
        "SOUNDWATCH_STORAGE_PATH" => option_env!("SOUNDWATCH_STORAGE_PATH"),
        _ => None,
    }
}
