//! # Configuration
//!
//! Meshgate reads a single TOML file. Every section except `[[devices]]` has defaults,
//! so a minimal file only lists the radios to connect to:
//!
//! ```toml
//! [[devices]]
//! name = "base"
//! host = "192.168.1.50"
//!
//! [mqtt]
//! enabled = true
//! root_topic = "msh/EU_868"
//!
//! [[channels]]
//! name = "Ops"
//! psk = "base64-encoded key"
//! ```
//!
//! Sections:
//!
//! - [`ServerConfig`] - HTTP bind address and event buffer
//! - [`DeviceConfig`] - one entry per radio (TCP stream API)
//! - [`SessionSettings`] - timeouts shared by all device sessions
//! - [`GatewaySettings`] - history sizes, traceroute and pruning knobs
//! - [`ChannelConfig`] - extra channel keys for decrypting broker traffic
//! - [`MqttConfig`] - broker bridge
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("{} device(s)", config.devices.len());
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::fs;

use crate::meshtastic::crypto::ChannelKey;
use crate::meshtastic::mqtt::MqttSettings;
use crate::meshtastic::parse_node_id;
use crate::meshtastic::session::SessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Events buffered per subscriber before a slow client starts missing them.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
}

fn default_device_port() -> u16 {
    4403
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Retry lost device links on this interval. Unset means manual reconnect only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_secs: Option<u64>,
    /// Connect every device when the gateway starts.
    pub connect_on_start: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            command_timeout_secs: 15,
            heartbeat_interval_secs: 60,
            reconnect_interval_secs: Some(30),
            connect_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub message_history: usize,
    /// Samples kept per node.
    pub telemetry_capacity: usize,
    pub traceroute_timeout_secs: u64,
    /// Finished traceroutes kept for polling.
    pub traceroute_retention: usize,
    pub node_stale_hours: u64,
    pub edge_max_age_secs: u64,
    /// A node counts as online when heard within this window.
    pub online_window_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            message_history: 500,
            telemetry_capacity: 100,
            traceroute_timeout_secs: 60,
            traceroute_retention: 200,
            node_stale_hours: 72,
            edge_max_age_secs: 6 * 3600,
            online_window_secs: 2 * 3600,
            maintenance_interval_secs: 300,
        }
    }
}

/// A named channel key. `psk` is base64 as shown by the Meshtastic apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub psk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub root_topic: String,
    /// Node ID (`!xxxxxxxx`) used when publishing. Random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    pub feed_capacity: usize,
    pub connect_on_start: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "mqtt.meshtastic.org".to_string(),
            port: 1883,
            username: Some("meshdev".to_string()),
            password: Some("large4cats".to_string()),
            client_id: None,
            root_topic: "msh/US".to_string(),
            gateway_id: None,
            feed_capacity: 200,
            connect_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("Invalid server.bind '{}': {}", self.server.bind, e))?;
        if self.server.event_buffer == 0 {
            bail!("server.event_buffer must be greater than zero");
        }

        let mut names = HashSet::new();
        for d in &self.devices {
            if d.name.trim().is_empty() {
                bail!("Device with host '{}' has an empty name", d.host);
            }
            if d.name == crate::gateway::pipeline::MQTT_SOURCE {
                bail!("Device name '{}' is reserved", d.name);
            }
            if !names.insert(d.name.as_str()) {
                bail!("Duplicate device name '{}'", d.name);
            }
            if d.host.trim().is_empty() {
                bail!("Device '{}' has no host", d.name);
            }
        }

        let s = &self.session;
        for (name, v) in [
            ("session.connect_timeout_secs", s.connect_timeout_secs),
            ("session.handshake_timeout_secs", s.handshake_timeout_secs),
            ("session.command_timeout_secs", s.command_timeout_secs),
            ("session.heartbeat_interval_secs", s.heartbeat_interval_secs),
            ("gateway.traceroute_timeout_secs", self.gateway.traceroute_timeout_secs),
            ("gateway.maintenance_interval_secs", self.gateway.maintenance_interval_secs),
        ] {
            if v == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if s.reconnect_interval_secs == Some(0) {
            bail!("session.reconnect_interval_secs must be greater than zero when set");
        }

        let g = &self.gateway;
        for (name, v) in [
            ("gateway.message_history", g.message_history),
            ("gateway.telemetry_capacity", g.telemetry_capacity),
            ("gateway.traceroute_retention", g.traceroute_retention),
            ("mqtt.feed_capacity", self.mqtt.feed_capacity),
        ] {
            if v == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        self.channel_keys()?;

        if let Some(id) = &self.mqtt.gateway_id {
            if parse_node_id(id).is_none() {
                bail!("Invalid mqtt.gateway_id '{}'", id);
            }
        }
        if self.mqtt.root_topic.trim_matches('/').is_empty() {
            bail!("mqtt.root_topic must not be empty");
        }
        Ok(())
    }

    /// Keys from `[[channels]]`, in file order. Unencrypted channels are skipped.
    pub fn channel_keys(&self) -> Result<Vec<ChannelKey>> {
        let mut keys = Vec::new();
        for c in &self.channels {
            let key = ChannelKey::from_base64(c.name.clone(), &c.psk)
                .map_err(|e| anyhow!("Channel '{}' has an invalid psk: {}", c.name, e))?;
            keys.extend(key);
        }
        Ok(keys)
    }

    pub fn session_config(&self, device: &DeviceConfig) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            name: device.name.clone(),
            host: device.host.clone(),
            port: device.port,
            connect_timeout: Duration::from_secs(s.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(s.handshake_timeout_secs),
            command_timeout: Duration::from_secs(s.command_timeout_secs),
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
            reconnect_interval: s.reconnect_interval_secs.map(Duration::from_secs),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let m = &self.mqtt;
        let defaults = MqttSettings::default();
        MqttSettings {
            host: m.host.clone(),
            port: m.port,
            username: m.username.clone(),
            password: m.password.clone(),
            client_id: m.client_id.clone().unwrap_or(defaults.client_id),
            root_topic: m.root_topic.trim_end_matches('/').to_string(),
            gateway_node: m
                .gateway_id
                .as_deref()
                .and_then(parse_node_id)
                .unwrap_or_else(crate::meshtastic::random_packet_id),
            feed_capacity: m.feed_capacity,
            keep_alive: defaults.keep_alive,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            devices: vec![DeviceConfig {
                name: "base".to_string(),
                host: "192.168.1.50".to_string(),
                port: default_device_port(),
            }],
            session: SessionSettings::default(),
            gateway: GatewaySettings::default(),
            channels: Vec::new(),
            mqtt: MqttConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshgate.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_round_trips() {
        let config = Config::default();
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.devices.len(), 1);
        assert_eq!(back.devices[0].port, 4403);
        assert_eq!(back.gateway.traceroute_timeout_secs, 60);
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[devices]]
            name = "roof"
            host = "10.0.0.2"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.devices[0].port, 4403);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(!config.mqtt.enabled);
        assert_eq!(config.gateway.message_history, 500);
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let mut config = Config::default();
        config.devices.push(config.devices[0].clone());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate device name"), "{}", err);
    }

    #[test]
    fn bad_psk_and_zero_capacity_are_rejected() {
        let mut config = Config::default();
        config.channels.push(ChannelConfig {
            name: "Ops".into(),
            psk: "not base64!".into(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.telemetry_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_config_maps_timeouts() {
        let config = Config::default();
        let s = config.session_config(&config.devices[0]);
        assert_eq!(s.port, 4403);
        assert_eq!(s.command_timeout, Duration::from_secs(15));
        assert_eq!(s.reconnect_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn mqtt_settings_parse_gateway_id() {
        let mut config = Config::default();
        config.mqtt.gateway_id = Some("!0000abcd".into());
        config.mqtt.root_topic = "msh/EU_868/".into();
        let m = config.mqtt_settings();
        assert_eq!(m.gateway_node, 0xabcd);
        assert_eq!(m.root_topic, "msh/EU_868");
    }
}
