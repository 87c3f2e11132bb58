//! Crate-wide error hierarchy.
//!
//! Layered the way the Modbus stack itself is layered: a buffer/frame-level
//! error, a fault a server handler reports, and the client-facing result
//! code a caller of [`crate::client`] actually receives. Internal framing
//! errors (CRC mismatch, address mismatch, inter-character violations) are
//! deliberately not part of this hierarchy: per spec they are absorbed by
//! the frame engine and only ever surface as diagnostics counters.

use thiserror::Error;

/// Errors that can occur while building or reading a [`crate::packet::Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("no space left in packet buffer")]
    NoSpaceLeft,
    #[error("requested field is out of bounds")]
    OutOfBounds,
}

/// A fault a [`crate::server::ServerHandler`] callback (or the dispatcher
/// itself, ahead of calling the handler) can report. Mapped to a Modbus
/// exception response by the dispatcher (spec.md §4.4 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFault {
    /// Maps to Modbus exception 0x01 (illegal function): an unrecognized
    /// function code, or a recognized one the handler declines outright.
    IllegalFunction,
    /// Maps to Modbus exception 0x02 (illegal data address).
    IllegalDataAddress,
    /// Maps to Modbus exception 0x03 (illegal data value): a request whose
    /// address is fine but whose quantity, byte count or value field is
    /// out of range or inconsistent with the rest of the request.
    IllegalDataValue,
    /// Maps to Modbus exception 0x04 (server device failure).
    DeviceFailure,
}

/// Result kind returned by every public client operation (spec.md §6 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("parameter out of the range allowed for this function code")]
    ParameterOutOfRange,
    #[error("the channel already has a request in flight")]
    TransportBusy,
    #[error("no valid response was received within the response timeout")]
    Timeout,
    #[error("the server returned a protocol exception: {0:#04x}")]
    Exception(u8),
    #[error("the response did not match the expected shape for this request")]
    MalformedResponse,
}

impl From<BufferError> for ClientError {
    fn from(_: BufferError) -> Self {
        ClientError::ParameterOutOfRange
    }
}
