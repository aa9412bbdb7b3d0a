use thiserror::Error;

use super::store::StoreError;
use super::transport::TransportError;

/// Errors surfaced by the connection core to its host.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The transport radio is powered off; scanning is suppressed.
    #[error("transport unavailable: radio is powered off")]
    TransportUnavailable,

    /// The connect-attempt timer reached its strike limit.
    #[error(
        "Connection failed after {attempts} attempts to connect to {device}. You may need to forget your device under Settings > Bluetooth."
    )]
    ConnectionTimeout { device: String, attempts: u32 },

    /// A required characteristic is missing; the firmware is treated as unsupported.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The radio reported firmware older than the configured minimum.
    #[error("firmware {found} is older than the minimum supported {minimum}")]
    FirmwareTooOld { found: String, minimum: String },

    /// Malformed inbound bytes; the value is dropped and the session continues.
    #[error("decode failure: {0}")]
    DecodeFailure(#[from] prost::DecodeError),

    /// A store write failed after the packet was already handed to the radio.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("transport disconnect: {0}")]
    TransportDisconnect(#[from] TransportError),

    /// Sends require a connected session with a writable ToRadio characteristic.
    #[error("no radio connected")]
    NotConnected,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no location fix available")]
    NoLocationFix,

    #[error("invalid channel url: {0}")]
    InvalidChannelUrl(String),

    /// The manager's event loop has exited.
    #[error("device manager stopped")]
    ManagerStopped,
}

pub type MeshResult<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_become_persistence_failures() {
        let err: MeshError = StoreError::Unavailable("disk full".into()).into();
        assert!(matches!(err, MeshError::PersistenceFailure(_)));
        assert_eq!(err.to_string(), "persistence failure: store unavailable: disk full");
    }

    #[test]
    fn connection_timeout_reads_as_guidance() {
        let err = MeshError::ConnectionTimeout {
            device: "Meshtastic_e01a".into(),
            attempts: 10,
        };
        assert!(err
            .to_string()
            .starts_with("Connection failed after 10 attempts to connect to Meshtastic_e01a."));
    }
}
