//! Transport boundary.
//!
//! The core never talks to a radio technology directly. A host adapter (CoreBluetooth,
//! BlueZ, a serial bridge, a test double) implements [`Transport`] for the commands and
//! feeds everything the radio stack reports back into the manager as [`TransportEvent`]s
//! over the channel returned by `DeviceManager::new`. Commands are fire-and-forget: their
//! outcome always arrives later as an event, never as a return value.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Meshtastic GATT service.
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6BA1B218_15A8_461F_9FA8_5DCAE273EAFD);
/// Phone -> radio writes.
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xF75C76D2_129E_4DAD_A1DD_7866124401E7);
/// Radio -> phone reads.
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2C55E69E_4993_11ED_B878_0242AC120002);
/// End-of-life FromRadio characteristic of firmware before 2.0. Never accepted.
pub const FROM_RADIO_LEGACY_UUID: Uuid = Uuid::from_u128(0x8BA2BCC2_EE02_4A55_A531_C525C5E454D5);
/// Notifies when new FromRadio data is queued.
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xED9DA18C_A800_4F66_A670_AA7547E34453);

/// Opaque transport address of a radio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The three channels of a Meshtastic session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    ToRadio,
    FromRadio,
    FromNum,
}

impl Characteristic {
    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::ToRadio => TO_RADIO_UUID,
            Characteristic::FromRadio => FROM_RADIO_UUID,
            Characteristic::FromNum => FROM_NUM_UUID,
        }
    }

    /// Map a discovered characteristic UUID. The end-of-life FromRadio UUID yields `None`.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        match *uuid {
            TO_RADIO_UUID => Some(Characteristic::ToRadio),
            FROM_RADIO_UUID => Some(Characteristic::FromRadio),
            FROM_NUM_UUID => Some(Characteristic::FromNum),
            _ => None,
        }
    }
}

/// Error reported by the transport stack. `code` is the platform error or ATT status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct TransportError {
    pub code: Option<i64>,
    pub description: String,
}

impl TransportError {
    pub fn new(code: Option<i64>, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// ATT status: insufficient authentication.
pub const ATT_INSUFFICIENT_AUTHENTICATION: i64 = 5;
/// ATT status: insufficient encryption.
pub const ATT_INSUFFICIENT_ENCRYPTION: i64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: DeviceId,
    pub name: String,
    pub rssi: i32,
}

/// Everything the transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PowerStateChanged { powered_on: bool },
    Discovered(Advertisement),
    Connected(DeviceId),
    ConnectFailed {
        id: DeviceId,
        error: Option<TransportError>,
    },
    /// `error == None` means the disconnect was requested locally.
    Disconnected {
        id: DeviceId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<Uuid>,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        characteristics: Vec<Uuid>,
        error: Option<TransportError>,
    },
    /// Result of a read, or a notification on a subscribed characteristic.
    ValueUpdated {
        id: DeviceId,
        characteristic: Characteristic,
        result: Result<Vec<u8>, TransportError>,
    },
}

/// Commands the manager issues to the radio stack.
pub trait Transport: Send {
    fn is_powered_on(&self) -> bool;
    fn is_scanning(&self) -> bool;
    fn start_scan(&mut self, service: Uuid);
    fn stop_scan(&mut self);
    fn connect(&mut self, id: &DeviceId);
    fn cancel_connection(&mut self, id: &DeviceId);
    fn is_connected(&self, id: &DeviceId) -> bool;
    fn discover_services(&mut self, id: &DeviceId, services: &[Uuid]);
    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid);
    /// Queue a write-with-response. Failure means the channel is no longer valid.
    fn write(
        &mut self,
        id: &DeviceId,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError>;
    /// Queue a read; the value arrives as [`TransportEvent::ValueUpdated`].
    fn read(&mut self, id: &DeviceId, characteristic: Characteristic);
    fn set_notify(&mut self, id: &DeviceId, characteristic: Characteristic, enabled: bool);
}

/// Classification of a transport disconnect into user-facing guidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// No error: the host asked for the disconnect.
    UserInitiated,
    /// Code 6: the link timed out, typically out of range.
    Timeout(String),
    /// Code 7: the radio closed the link.
    PeerDisconnected(String),
    /// Code 14: the pairing information was removed on the peer.
    PairingRemoved(String),
    Other(String),
}

impl DisconnectCause {
    pub fn classify(error: Option<&TransportError>) -> Self {
        match error {
            None => DisconnectCause::UserInitiated,
            Some(err) => {
                let desc = err.description.clone();
                match err.code {
                    Some(6) => DisconnectCause::Timeout(desc),
                    Some(7) => DisconnectCause::PeerDisconnected(desc),
                    Some(14) => DisconnectCause::PairingRemoved(desc),
                    _ => DisconnectCause::Other(desc),
                }
            }
        }
    }

    /// Message to surface to the user; `None` for user-initiated disconnects.
    pub fn guidance(&self) -> Option<String> {
        match self {
            DisconnectCause::UserInitiated => None,
            DisconnectCause::Timeout(desc) => Some(format!(
                "{} The app will automatically reconnect to the preferred radio if it comes back in range.",
                desc
            )),
            DisconnectCause::PairingRemoved(desc) => Some(format!(
                "{} This error usually cannot be fixed without forgetting the device under Settings > Bluetooth and re-connecting to the radio.",
                desc
            )),
            DisconnectCause::PeerDisconnected(desc) | DisconnectCause::Other(desc) => {
                Some(desc.clone())
            }
        }
    }
}
