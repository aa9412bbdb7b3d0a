//! # Meshtastic Device Communication Module
//!
//! Everything between a radio transport and the host application: the connection state
//! machine, the ToRadio/FromRadio codec, the discovered-device registry, admin request
//! correlation, inbound packet dispatch and periodic location reports.
//!
//! ## Event Flow
//!
//! ```text
//! Transport adapter ──TransportEvent──┐
//! RepeatingTimer ─────tick────────────┼──> DeviceManager::handle_event ──> MeshStore
//! ManagerHandle ──────Command─────────┘              │
//!                                                    └──> Transport (write/read/notify)
//! ```
//!
//! All three sources feed one unbounded queue, so the manager processes exactly one event
//! at a time and never needs a lock around session state.
//!
//! ## Handshake
//!
//! After connecting, the manager discovers the Meshtastic service and its three
//! characteristics, writes `want_config_id = nonce` and drains FromRadio until a
//! `config_complete_id` equal to that nonce arrives. Radios reporting firmware older than
//! the configured minimum are disconnected and excluded from auto-reconnect.

pub mod codec;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod framer;
pub mod manager;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod store;
pub mod timer;
pub mod transport;
pub mod version;

pub use codec::{AdminRequest, Inbound, OutboundPacket, BROADCAST_NUM};
pub use correlator::{PendingAdminRequest, Resolution};
pub use error::{MeshError, MeshResult};
pub use flags::PositionFlags;
pub use framer::StreamFramer;
pub use manager::{DeviceManager, ManagerEvent, ManagerHandle, ManagerStatus, TransportEventSender};
pub use registry::{DeviceRegistry, DiscoveredDevice};
pub use reporter::{FixedLocation, LocationFix, LocationProvider};
pub use session::{ConnectionState, SessionSummary};
pub use store::{Direction, MemoryState, MemoryStore, MeshStore, PacketKind, PacketRecord, StoreError};
pub use transport::{
    Advertisement, Characteristic, DeviceId, DisconnectCause, Transport, TransportError,
    TransportEvent,
};
pub use version::FirmwareVersion;
