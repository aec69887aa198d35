//! The seam between the session and the radio stack.
//!
//! The session is written against [`BleTransport`] only; the `bluest`
//! backend lives behind the `bluest-transport` feature and tests drive the
//! session with a scripted mock instead of hardware.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// GATT service the D2 firmware exposes its UART-style characteristics under.
pub const SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
/// Commands are written here (write without response).
pub const WRITE_CHARACTERISTIC_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";
/// Responses arrive as notifications on this characteristic.
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// The device lacks a required characteristic. Retrying cannot help.
    #[error("device does not expose required characteristic {0}")]
    UnsupportedDevice(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("bluetooth backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap a backend-specific error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    /// Fatal errors abort the connect sequence instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::UnsupportedDevice(_))
    }
}

/// What the session requires from a BLE radio.
///
/// Implementations are constructed with the target device address; the
/// session injects the transport through its constructor (no registry).
#[async_trait]
pub trait BleTransport: Send {
    /// Connect directly to the configured address.
    async fn connect(&mut self, timeout: Duration) -> std::result::Result<(), TransportError>;

    /// Active scan filtered by the configured address, then connect.
    /// Used as fallback when the direct path fails.
    async fn scan_connect(&mut self, timeout: Duration) -> std::result::Result<(), TransportError>;

    /// Write one command frame to the write characteristic.
    async fn write_command(&mut self, payload: &[u8]) -> std::result::Result<(), TransportError>;

    /// Subscribe to the notify characteristic. Each received notification
    /// buffer is delivered in arrival order on the returned channel.
    async fn subscribe(&mut self) -> std::result::Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Unsubscribe and close the connection. Must be safe to call in any
    /// state, repeatedly.
    async fn close(&mut self);
}
