//! Error types. Decoders and framers return the narrow `(kind, detail)` pair
//! spec.md §7 specifies so callers can map straight to a QUIC transport-level
//! error code without inspecting a string; everything above that boundary
//! (configuration, dispatch-level failures) uses `failure`, the way the
//! teacher's `EndpointError` does.

use std::fmt;

use failure::Fail;

/// Transport-level error codes a decoder/framer can report (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPacketHeader,
    InvalidVersion,
    InvalidVersionNegotiationPacket,
    MissingPayload,
    InvalidFrameData,
    IetfQuicProtocolViolation,
    DecryptionFailure,
    PacketTooLarge,
    HandshakeFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidPacketHeader => "INVALID_PACKET_HEADER",
            ErrorKind::InvalidVersion => "INVALID_VERSION",
            ErrorKind::InvalidVersionNegotiationPacket => "INVALID_VERSION_NEGOTIATION_PACKET",
            ErrorKind::MissingPayload => "MISSING_PAYLOAD",
            ErrorKind::InvalidFrameData => "INVALID_FRAME_DATA",
            ErrorKind::IetfQuicProtocolViolation => "IETF_QUIC_PROTOCOL_VIOLATION",
            ErrorKind::DecryptionFailure => "DECRYPTION_FAILURE",
            ErrorKind::PacketTooLarge => "PACKET_TOO_LARGE",
            ErrorKind::HandshakeFailed => "HANDSHAKE_FAILED",
        };
        f.write_str(s)
    }
}

/// The boundary type every decoder/framer function in this crate returns on
/// failure: a `(kind, detail)` pair, never a `failure::Error`. Kept separate
/// from `DispatchError` below so callers above the wire-parsing layer can
/// pattern-match on `kind` without downcasting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        TransportError {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl ::std::error::Error for TransportError {}

/// Dispatcher-level failures, the crate's public error surface.
#[derive(Debug, Fail)]
pub enum DispatchError {
    #[fail(display = "malformed packet: {}", _0)]
    Transport(#[cause] TransportErrorFail),

    #[fail(display = "too many connections pending a CHLO")]
    TooManyPendingConnections,

    #[fail(display = "connection id {} is already in the time-wait list", _0)]
    AlreadyTimeWait(String),

    #[fail(display = "no ALPN offered by the client matched the server's supported set")]
    NoMatchingAlpn,
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        DispatchError::Transport(TransportErrorFail(e))
    }
}

/// Adapter so `TransportError` (a plain struct, reused as the decoder return
/// type) can also be carried inside the `failure::Fail` hierarchy.
#[derive(Debug)]
pub struct TransportErrorFail(pub TransportError);

impl fmt::Display for TransportErrorFail {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Fail for TransportErrorFail {}

/// Errors constructing a `Config` (spec.md §6 invariants — e.g. an empty
/// `supported_versions` list).
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "supported_versions must not be empty")]
    NoSupportedVersions,

    #[fail(display = "expected_server_connection_id_length {} is out of range", _0)]
    InvalidCidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display_matches_wire_name() {
        assert_eq!(ErrorKind::InvalidFrameData.to_string(), "INVALID_FRAME_DATA");
    }
}
