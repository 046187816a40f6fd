use crate::error::DhtError;
use crate::protocol::Envelope;

/// Largest datagram the node sends or accepts.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, DhtError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Envelope, DhtError> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::FrameTooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}
