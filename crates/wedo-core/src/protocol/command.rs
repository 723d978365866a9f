//! Outbound commands.

use std::fmt;

use crate::device::{DeviceKind, SetupProfile};

/// Operation a command performs; the table maps it to a type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    MotorPower,
    PortSetup,
    LedRgb,
    LedIndex,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::MotorPower => write!(f, "MOTOR_POWER"),
            Opcode::PortSetup => write!(f, "PORT_SETUP"),
            Opcode::LedRgb => write!(f, "LED_RGB"),
            Opcode::LedIndex => write!(f, "LED_INDEX"),
        }
    }
}

/// Opcode together with its parameters.
///
/// Values are not range-checked here; the codec validates them before
/// anything is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Motor power in percent, -100..=100. Zero stops the motor.
    MotorPower { power: i32 },
    /// Input format request sent after a port attaches.
    PortSetup {
        kind: DeviceKind,
        mode: u8,
        format: u8,
        delta: u32,
        notify: bool,
    },
    LedRgb { red: u8, green: u8, blue: u8 },
    /// Built-in palette colour, 0..=10.
    LedIndex { index: u8 },
}

impl CommandKind {
    pub fn opcode(&self) -> Opcode {
        match self {
            CommandKind::MotorPower { .. } => Opcode::MotorPower,
            CommandKind::PortSetup { .. } => Opcode::PortSetup,
            CommandKind::LedRgb { .. } => Opcode::LedRgb,
            CommandKind::LedIndex { .. } => Opcode::LedIndex,
        }
    }

    /// Port setup request for `kind` using its table profile.
    pub fn setup(kind: DeviceKind, profile: SetupProfile) -> Self {
        CommandKind::PortSetup {
            kind,
            mode: profile.mode,
            format: profile.format,
            delta: profile.delta,
            notify: profile.notify,
        }
    }
}

/// An immutable command addressed to one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    port: u8,
    kind: CommandKind,
    correlation: Option<u8>,
}

impl Command {
    pub fn new(port: u8, kind: CommandKind) -> Self {
        Self {
            port,
            kind,
            correlation: None,
        }
    }

    /// Copy of this command carrying correlation identifier `id`.
    pub fn with_correlation(&self, id: u8) -> Self {
        Self {
            correlation: Some(id),
            ..self.clone()
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    pub fn correlation(&self) -> Option<u8> {
        self.correlation
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port={}", self.opcode(), self.port)?;
        if let Some(id) = self.correlation {
            write!(f, " seq={}", id)?;
        }
        Ok(())
    }
}
