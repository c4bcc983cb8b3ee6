//! # Meshgate - Gateway and Aggregation Engine for Meshtastic Networks
//!
//! Meshgate keeps long-lived TCP links to local Meshtastic radios, listens to the wider
//! mesh through an MQTT broker, and merges everything it hears into one live picture of
//! the network: nodes, links, telemetry history and text messages.
//!
//! ## Features
//!
//! - **Device Sessions**: stream-API TCP links with configuration handshake, heartbeats,
//!   acknowledged commands (send text, traceroute, owner / position / channel changes,
//!   reboot) and optional automatic reconnect.
//! - **MQTT Bridge**: `ServiceEnvelope` decoding with channel-key decryption and a bounded
//!   live feed.
//! - **Node Registry**: field-level last-writer-wins merge of every observation.
//! - **Topology Graph**: links from direct receptions, neighbor reports and traceroutes.
//! - **Traceroutes**: request/response correlation with per-request timeouts.
//! - **Telemetry History**: bounded per-node samples and fleet summaries.
//! - **HTTP API**: JSON endpoints plus a server-sent event stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (gateway, _tasks) = Gateway::start(&config)?;
//!     gateway.connect_on_start(&config);
//!     for node in gateway.nodes() {
//!         println!("{} {:?}", node.id, node.long_name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - framing, codec, crypto, device sessions and the MQTT bridge
//! - [`mesh`] - registry, topology, telemetry, messages and traceroutes
//! - [`gateway`] - the facade tying them together, events and the HTTP API
//! - [`config`] - TOML configuration
//! - [`protobuf`] - the Meshtastic message subset the gateway speaks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐
//! │ Device       │  │ MQTT Bridge  │ ← inbound packets
//! │ Sessions     │  │              │
//! └──────────────┘  └──────────────┘
//!          │               │
//! ┌─────────────────────────────────┐
//! │ Pipeline: registry, topology,   │ ← aggregation
//! │ telemetry, messages, traceroute │
//! └─────────────────────────────────┘
//!          │
//! ┌─────────────────────────────────┐
//! │ Events + HTTP API               │ ← boundary
//! └─────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod logutil;
pub mod mesh;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;

pub use error::{FormatError, GatewayError, GatewayResult};
