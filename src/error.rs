use std::time::Duration;

use crate::protocol::FrameError;
use crate::reading::DecodeError;
use crate::transport::TransportError;

/// Session-level error type.
///
/// Frame and decode failures are absorbed by the read loop (the tick just
/// produces no reading); only connect-phase exhaustion and an unsupported
/// device surface to the caller as terminal failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A response frame failed structural or CRC validation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// A validated payload could not be decoded into a reading.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// An error from the BLE transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// No parseable response arrived within the wait window.
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    /// An operation requires an established connection.
    #[error("not connected")]
    NotConnected,
    /// The whole connect sequence was exhausted.
    #[error("connect failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u8,
        #[source]
        source: TransportError,
    },
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
