//! Decoded inbound messages.

use std::fmt;

use crate::device::DeviceKind;

/// One decoded hub-to-host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A device was plugged into `port`.
    PortAttached { port: u8, kind: DeviceKind },
    PortDetached { port: u8 },
    /// Input format confirmation that completes the attach handshake.
    PortInfo { port: u8, mode: u8, format: u8 },
    SensorValue { port: u8, payload: Vec<u8> },
    CommandAck { port: u8, correlation: u8 },
    Error { port: u8, correlation: u8, code: u8 },
}

impl Message {
    pub fn port(&self) -> u8 {
        match self {
            Message::PortAttached { port, .. }
            | Message::PortDetached { port }
            | Message::PortInfo { port, .. }
            | Message::SensorValue { port, .. }
            | Message::CommandAck { port, .. }
            | Message::Error { port, .. } => *port,
        }
    }

    /// Short tag for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::PortAttached { .. } => "PortAttached",
            Message::PortDetached { .. } => "PortDetached",
            Message::PortInfo { .. } => "PortInfo",
            Message::SensorValue { .. } => "SensorValue",
            Message::CommandAck { .. } => "CommandAck",
            Message::Error { .. } => "Error",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::PortAttached { port, kind } => {
                write!(f, "PortAttached port={} kind={}", port, kind)
            }
            Message::PortDetached { port } => write!(f, "PortDetached port={}", port),
            Message::PortInfo { port, mode, format } => {
                write!(f, "PortInfo port={} mode={} format={}", port, mode, format)
            }
            Message::SensorValue { port, payload } => {
                write!(f, "SensorValue port={} payload={:02X?}", port, payload)
            }
            Message::CommandAck { port, correlation } => {
                write!(f, "CommandAck port={} seq={}", port, correlation)
            }
            Message::Error {
                port,
                correlation,
                code,
            } => write!(
                f,
                "Error port={} seq={} code=0x{:02X}",
                port, correlation, code
            ),
        }
    }
}
