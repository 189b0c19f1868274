use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Only set if not already set (env vars take precedence)
            if std::env::var(key).is_err() {
                // SAFETY: We're single-threaded at this point (called before any async runtime)
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

/// How the window opener is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Serial,
    Telnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub drive: DriveConfig,
    pub poll: PollConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub kind: ConnectionKind,
    pub serial_port: String,
    pub host: String,
    pub port: u16,
}

/// Motion durations of the drive in seconds. The AXA Remote never reports
/// a travel position, so these drive the time-based estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub unlock_secs: f64,
    pub travel_secs: f64,
    pub lock_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval while the window is moving.
    pub moving_interval_ms: u64,
    /// Interval right after a set-position command, to catch the drive
    /// settling on its target.
    pub settling_interval_ms: u64,
    /// Interval while the drive is unreachable.
    pub offline_interval_ms: u64,
    /// Mark the cover unavailable after this many consecutive refresh
    /// failures. 0 disables the threshold.
    pub offline_after_failures: u32,
}

impl PollConfig {
    pub fn moving(&self) -> Duration {
        Duration::from_millis(self.moving_interval_ms)
    }

    pub fn settling(&self) -> Duration {
        Duration::from_millis(self.settling_interval_ms)
    }

    pub fn offline(&self) -> Duration {
        Duration::from_millis(self.offline_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of the cover's own topics (state, position, set, ...).
    pub base_topic: String,
    /// Friendly name announced to the platform.
    pub cover_name: String,
    /// Prefix the platform listens on for discovery announcements.
    pub discovery_prefix: String,
    /// Publish a retained discovery announcement on startup.
    pub announce: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                kind: ConnectionKind::Serial,
                serial_port: "/dev/ttyUSB0".to_string(),
                host: "10.0.0.30".to_string(),
                port: 23,
            },
            drive: DriveConfig {
                unlock_secs: 5.0,
                travel_secs: 42.0,
                lock_secs: 5.0,
            },
            poll: PollConfig {
                moving_interval_ms: 1000,
                settling_interval_ms: 100,
                offline_interval_ms: 5000,
                offline_after_failures: 0,
            },
            mqtt: MqttConfig {
                broker_host: "10.0.0.2".to_string(),
                broker_port: 1883,
                client_id: "window-cover-bridge".to_string(),
                username: None,
                password: None,
                base_topic: "window-cover/window".to_string(),
                cover_name: "Window".to_string(),
                discovery_prefix: "homeassistant".to_string(),
                announce: true,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(kind) = std::env::var("CONNECTION_TYPE")
            && let Ok(k) = kind.parse()
        {
            config.connection.kind = k;
        }
        if let Ok(port) = std::env::var("SERIAL_PORT") {
            config.connection.serial_port = port;
        }
        if let Ok(host) = std::env::var("TELNET_HOST") {
            config.connection.host = host;
        }
        if let Ok(port) = std::env::var("TELNET_PORT")
            && let Ok(p) = port.parse()
        {
            config.connection.port = p;
        }

        // Drive timings
        if let Ok(secs) = std::env::var("DRIVE_UNLOCK_SECS")
            && let Ok(s) = secs.parse()
        {
            config.drive.unlock_secs = s;
        }
        if let Ok(secs) = std::env::var("DRIVE_TRAVEL_SECS")
            && let Ok(s) = secs.parse()
        {
            config.drive.travel_secs = s;
        }
        if let Ok(secs) = std::env::var("DRIVE_LOCK_SECS")
            && let Ok(s) = secs.parse()
        {
            config.drive.lock_secs = s;
        }

        // Polling
        if let Ok(ms) = std::env::var("POLL_MOVING_INTERVAL_MS")
            && let Ok(m) = ms.parse()
        {
            config.poll.moving_interval_ms = m;
        }
        if let Ok(ms) = std::env::var("POLL_SETTLING_INTERVAL_MS")
            && let Ok(m) = ms.parse()
        {
            config.poll.settling_interval_ms = m;
        }
        if let Ok(ms) = std::env::var("POLL_OFFLINE_INTERVAL_MS")
            && let Ok(m) = ms.parse()
        {
            config.poll.offline_interval_ms = m;
        }
        if let Ok(count) = std::env::var("POLL_OFFLINE_AFTER_FAILURES")
            && let Ok(c) = count.parse()
        {
            config.poll.offline_after_failures = c;
        }

        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(topic) = std::env::var("MQTT_BASE_TOPIC") {
            config.mqtt.base_topic = topic;
        }
        if let Ok(name) = std::env::var("MQTT_COVER_NAME") {
            config.mqtt.cover_name = name;
        }
        if let Ok(prefix) = std::env::var("MQTT_DISCOVERY_PREFIX") {
            config.mqtt.discovery_prefix = prefix;
        }
        if let Ok(announce) = std::env::var("MQTT_ANNOUNCE")
            && let Ok(a) = announce.parse()
        {
            config.mqtt.announce = a;
        }

        config
    }
}
