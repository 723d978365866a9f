//! Hub transport abstraction.
//!
//! The engine never talks to a radio directly. A transport writes frames to
//! an endpoint and hands out the hub's notifications as an ordered stream of
//! byte chunks; a scanner finds hubs and opens transports to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Endpoint;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Hub disconnected")]
    Disconnected,

    #[error("Notification stream already taken")]
    StreamTaken,

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: String, message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered byte chunks as the hub sent them. Chunk boundaries carry no
/// meaning; the stream ends when the link drops.
pub type NotificationStream = mpsc::UnboundedReceiver<Vec<u8>>;

/// Abstract hub transport interface.
///
/// This trait enables:
/// - A BLE implementation mapping endpoints to GATT characteristics
/// - Mock implementation for testing
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Write one complete frame to `endpoint`.
    async fn write(&self, endpoint: Endpoint, data: &[u8]) -> Result<(), TransportError>;

    /// Take the notification stream. Only the first call succeeds.
    fn notifications(&self) -> Result<NotificationStream, TransportError>;

    fn is_connected(&self) -> bool;

    /// Stable identifier of the hub (radio address).
    fn address(&self) -> String;
}

/// A hub seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    pub address: String,
    pub name: String,
}

#[async_trait]
pub trait HubScanner: Send + Sync {
    /// Enumerate advertising hubs for up to `timeout`.
    async fn scan(&self, timeout: Duration) -> Result<Vec<HubDescriptor>, TransportError>;

    /// Open a transport to `hub`.
    async fn connect(&self, hub: &HubDescriptor) -> Result<Arc<dyn HubTransport>, TransportError>;
}
