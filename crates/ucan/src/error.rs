use can_transport::TransportError;
use thiserror::Error;

/// Failures constructing or decoding protocol values.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame body too short for {0}")]
    Truncated(&'static str),
    #[error("register payload of {0} bytes does not fit the 3-bit size field")]
    PayloadTooLarge(usize),
    #[error("size is derived from attached data and cannot be set directly")]
    SizeWithData,
}

/// Failures parsing a hardware identifier representation.
#[derive(Debug, Error)]
pub enum HardwareIdError {
    #[error("hardware id must be exactly 7 bytes, got {0}")]
    Length(usize),
    #[error("invalid hex byte {0:?} in hardware id")]
    Hex(String),
}

/// Failures surfaced by bus operations.
///
/// A peer that never answers is not an error: request/response operations
/// return `Ok(None)` when the timeout window elapses.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transfer of {0} bytes exceeds the 6-byte per-request limit")]
    TransferTooLong(usize),
    #[error("address negotiation exhausted after probing {0} candidates")]
    NegotiationExhausted(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
