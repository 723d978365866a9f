//! Event system for caller decoupling.
//!
//! Lets a CLI, a GUI or a test subscribe to engine events without the
//! engine knowing who is listening.

use std::fmt;

use crate::device::Value;
use crate::port::PortState;
use crate::protocol::{MalformedReason, Opcode};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Hub
    Rx, // Hub -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a hub engine.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Transport opened and writer running.
    Connected { hub: String },
    /// Notification stream ended or the hub was shut down.
    Disconnected { hub: String, reason: String },
    /// A port moved through its lifecycle.
    PortStateChanged {
        port: u8,
        from: PortState,
        to: PortState,
    },
    /// New sensor reading cached on a port.
    ValueUpdated { port: u8, value: Value },
    /// Correlated command acknowledged.
    AckReceived {
        port: u8,
        opcode: Opcode,
        correlation: u8,
    },
    /// Acknowledgement for an identifier that already timed out.
    LateAck { port: u8, correlation: u8 },
    /// Hub answered a command with an error code.
    CommandRejected {
        port: u8,
        correlation: u8,
        code: u8,
    },
    /// Garbage skipped on the notification stream.
    FrameDiscarded {
        reason: MalformedReason,
        discarded: usize,
    },
    /// Frame written or received.
    Packet {
        direction: PacketDirection,
        label: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving hub events.
///
/// Called synchronously from the engine, never while an internal lock is
/// held. Implementations should return quickly.
pub trait HubObserver: Send + Sync {
    fn on_event(&self, event: &HubEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl HubObserver for NullObserver {
    fn on_event(&self, _event: &HubEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl HubObserver for TracingObserver {
    fn on_event(&self, event: &HubEvent) {
        match event {
            HubEvent::Connected { hub } => {
                tracing::info!(hub = %hub, "Hub connected");
            }
            HubEvent::Disconnected { hub, reason } => {
                tracing::warn!(hub = %hub, reason = %reason, "Hub disconnected");
            }
            HubEvent::PortStateChanged { port, from, to } => {
                tracing::info!(port, from = %from, to = %to, "Port state changed");
            }
            HubEvent::ValueUpdated { port, value } => {
                tracing::debug!(port, value = %value, "Value updated");
            }
            HubEvent::AckReceived {
                port,
                opcode,
                correlation,
            } => {
                tracing::debug!(port, opcode = %opcode, seq = correlation, "ACK received");
            }
            HubEvent::LateAck { port, correlation } => {
                tracing::debug!(port, seq = correlation, "Late ACK discarded");
            }
            HubEvent::CommandRejected {
                port,
                correlation,
                code,
            } => {
                tracing::warn!(port, seq = correlation, code = %format!("0x{:02X}", code), "Command rejected");
            }
            HubEvent::FrameDiscarded { reason, discarded } => {
                tracing::warn!(reason = %reason, discarded, "Frame discarded");
            }
            HubEvent::Packet {
                direction,
                label,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, label = %label, len = length, "Frame");
            }
            HubEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
