use thiserror::Error;
use udpconn_binary::BinaryError;

/// Errors that can surface out of the protocol engine.
///
/// Per-connection protocol violations (bad session id, duplicate ACK, ...)
/// are *not* represented here: they are recovered locally via teardown and
/// never propagate past `Connection::process_packet`. This enum covers the
/// failures a caller actually needs to react to.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The underlying UDP socket failed.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A header or frame failed to decode.
    #[error("wire format error: {0}")]
    Wire(#[from] BinaryError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
