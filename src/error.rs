use thiserror::Error;

/// Errors raised by the library's I/O edges (sockets, blob files, codecs).
///
/// Protocol outcomes such as "key not found" or "peer did not answer" are not
/// errors; they are part of the normal result space of the RPC handlers.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the datagram limit")]
    FrameTooLarge(usize),

    #[error("invalid node id")]
    InvalidNodeId,
}
