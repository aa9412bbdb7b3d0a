//! Connection states and the active session.

use std::fmt;

use super::correlator::PendingRequests;
use super::flags::PositionFlags;
use super::transport::{Characteristic, DeviceId};

/// Lifecycle of the single radio connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting { target: DeviceId, attempts: u32 },
    DiscoveringServices,
    AwaitingHandshake { nonce: u32 },
    Subscribed,
    Disconnecting,
}

impl ConnectionState {
    /// A link exists (or is being negotiated) with a radio.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::DiscoveringServices
                | ConnectionState::AwaitingHandshake { .. }
                | ConnectionState::Subscribed
        )
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting { target, attempts } => {
                write!(f, "connecting to {} (attempt {})", target, attempts)
            }
            ConnectionState::DiscoveringServices => write!(f, "discovering services"),
            ConnectionState::AwaitingHandshake { nonce } => {
                write!(f, "awaiting config complete {}", nonce)
            }
            ConnectionState::Subscribed => write!(f, "subscribed"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// The connection currently owned by the manager.
#[derive(Debug)]
pub struct ActiveSession {
    pub device: DeviceId,
    pub name: String,
    /// 0 until the radio reports `my_info`.
    pub node_num: u32,
    pub firmware_version: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub has_to_radio: bool,
    pub has_from_radio: bool,
    pub has_from_num: bool,
    /// Nonce of the want-config request in flight, if any.
    pub handshake_nonce: Option<u32>,
    pub config_complete: bool,
    pub position_flags: PositionFlags,
    pub pending: PendingRequests,
}

impl ActiveSession {
    pub fn new(device: DeviceId, name: String) -> Self {
        Self {
            device,
            name,
            node_num: 0,
            firmware_version: None,
            long_name: None,
            short_name: None,
            has_to_radio: false,
            has_from_radio: false,
            has_from_num: false,
            handshake_nonce: None,
            config_complete: false,
            position_flags: PositionFlags::default(),
            pending: PendingRequests::default(),
        }
    }

    pub fn mark_characteristic(&mut self, ch: Characteristic) {
        match ch {
            Characteristic::ToRadio => self.has_to_radio = true,
            Characteristic::FromRadio => self.has_from_radio = true,
            Characteristic::FromNum => self.has_from_num = true,
        }
    }

    /// Writes are possible once the ToRadio characteristic is known.
    pub fn can_write(&self) -> bool {
        self.has_to_radio
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            device: self.device.clone(),
            name: self.name.clone(),
            node_num: self.node_num,
            firmware_version: self.firmware_version.clone(),
            long_name: self.long_name.clone(),
            short_name: self.short_name.clone(),
            config_complete: self.config_complete,
            pending_admin_requests: self.pending.len(),
        }
    }
}

/// Read-only copy of session fields handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub device: DeviceId,
    pub name: String,
    pub node_num: u32,
    pub firmware_version: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub config_complete: bool,
    pub pending_admin_requests: usize,
}
