//! # Meshlink - Meshtastic radio connection core
//!
//! Meshlink is the device-communication core of a Meshtastic client application. It discovers
//! radios, owns the single live connection to one of them, runs the want-config handshake,
//! frames Meshtastic protobuf traffic over a characteristic read/write/notify transport and
//! routes decoded packets to the host's persistence layer.
//!
//! ## Features
//!
//! - **Connection State Machine**: scan, connect with a 10-strike timeout, service and
//!   characteristic discovery, nonce-matched handshake, subscribed session, classified disconnects.
//! - **Device Registry**: discovered radios with signal strength and a short freshness window.
//! - **Admin Correlation**: outbound admin packets are tracked until acknowledged or expired.
//! - **Inbound Dispatch**: exhaustive routing over Meshtastic port numbers.
//! - **Location Reporting**: periodic position broadcasts while subscribed.
//! - **Async Design**: a single Tokio event loop serializes transport callbacks, timers and host commands.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//! use meshlink::meshtastic::{DeviceManager, FixedLocation, MemoryStore, Transport};
//!
//! async fn start(transport: Box<dyn Transport>) -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     meshlink::logutil::init_logging(&config.logging, 0);
//!
//!     let (manager, handle, transport_tx) = DeviceManager::new(
//!         config.settings()?,
//!         transport,
//!         Box::new(MemoryStore::default()),
//!         Box::new(FixedLocation::from_config(&config.location)),
//!     );
//!     // Hand `transport_tx` to the BLE adapter so it can deliver events.
//!     drop(transport_tx);
//!     tokio::spawn(manager.run());
//!     handle.start_scanning().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - connection state machine, codec, registry, dispatch and reporters
//! - [`config`] - configuration management and validation
//! - [`protobuf`] - Meshtastic protocol buffer messages
//! - [`logutil`] - logging setup and log-safe string helpers
//! - [`metrics`] - process-wide counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Host / GUI    │ ← ManagerHandle commands, ManagerStatus snapshots
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  DeviceManager  │ ← event loop: state machine, correlator, dispatcher, reporter
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌────────┐
//! │Transport│ │MeshStore│ ← host-implemented collaborators
//! └────────┘ └────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
