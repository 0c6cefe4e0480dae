//! Error taxonomy for the buffer, codec, transport and dispatch layers (spec §7).

use thiserror::Error as ThisError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All ways a packet, codec, transport or Host I/O operation can fail.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Attempted to read past the end of a buffer's unread data.
    #[error("buffer underflow")]
    Underflow,

    /// Attempted to write more than the buffer's remaining capacity.
    #[error("buffer too small, only {writable} bytes writable")]
    BufferTooSmall { writable: usize },

    /// A codec failed to parse its input, or a received checksum mismatched.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// No packet or query handler matched the request.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// A transport operation exceeded its configured timeout.
    #[error("operation timed out")]
    TimedOut,

    /// The client's `F` reply carried a negative return code with an errno.
    #[error("host I/O call failed with errno {errno}")]
    HostIoFailure { errno: i32 },

    /// Two Host I/O replies arrived with no outstanding request to match.
    #[error("unexpected host I/O reply with no outstanding request")]
    UnexpectedHostIoReply,

    /// The underlying socket was closed or a lower-layer I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A pending Host I/O call was cancelled because the connection stopped.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Maps this error to the `E<hh>` code sent back to the peer (§7).
    pub fn wire_code(&self) -> u8 {
        match self {
            Error::BufferTooSmall { .. } | Error::Underflow => 0x02,
            _ => 0x01,
        }
    }
}
