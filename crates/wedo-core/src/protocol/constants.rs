//! Protocol constants and the versioned wire table.
//!
//! Everything device-family specific (message type bytes, checksum rule,
//! device kinds and their setup profiles) is collected in a [`ProtocolTable`].
//! The codec and registry only ever consult the table, so a new hub family or
//! device kind is a new table entry rather than a control-flow change.

use crate::device::{Capabilities, DeviceKind, SetupProfile, ValueFormat};
use crate::protocol::command::Opcode;

// ============================================================================
// Hub Identification
// ============================================================================

/// Advertised name fragments of WeDo 2.0 hubs.
pub const HUB_NAME_PATTERNS: &[&str] = &["WeDo", "LPF2"];

/// Vendor base shared by the WeDo 2.0 GATT characteristics.
pub const UUID_CUSTOM_BASE: &str = "1212-efde-1523-785feabcd123";

/// Motor and LED commands.
pub const CHARACTERISTIC_OUTPUT_COMMAND: &str = "00001565-1212-efde-1523-785feabcd123";
/// Port input format (setup) commands.
pub const CHARACTERISTIC_INPUT_COMMAND: &str = "00001563-1212-efde-1523-785feabcd123";
/// Attach/detach notifications.
pub const CHARACTERISTIC_PORT_TYPE: &str = "00001527-1212-efde-1523-785feabcd123";
/// Sensor value notifications.
pub const CHARACTERISTIC_SENSOR_VALUE: &str = "00001560-1212-efde-1523-785feabcd123";

// ============================================================================
// Framing
// ============================================================================

/// `[len][type][port]` precede the payload.
pub const FRAME_HEADER_LEN: usize = 3;
/// Header plus checksum, empty payload.
pub const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + 1;
pub const MAX_FRAME_LEN: usize = 64;

/// Number of addressable ports on a WeDo 2.0 hub (0..=7).
pub const WEDO2_PORT_COUNT: u8 = 8;

// ============================================================================
// Outbound Message Types (Host -> Hub)
// ============================================================================

pub const MSG_MOTOR_POWER: u8 = 0x01;
pub const MSG_PORT_SETUP: u8 = 0x02;
pub const MSG_LED_RGB: u8 = 0x04;
pub const MSG_LED_INDEX: u8 = 0x07;

// ============================================================================
// Inbound Message Types (Hub -> Host)
// ============================================================================

pub const MSG_PORT_ATTACHED: u8 = 0x01;
pub const MSG_PORT_DETACHED: u8 = 0x02;
pub const MSG_ERROR: u8 = 0x05;
pub const MSG_SENSOR_VALUE: u8 = 0x45;
pub const MSG_PORT_INFO: u8 = 0x47;
pub const MSG_COMMAND_ACK: u8 = 0x82;

// ============================================================================
// Device Type IDs
// ============================================================================

pub const DEVICE_MOTOR: u8 = 0x01;
pub const DEVICE_VOLTAGE: u8 = 0x14;
pub const DEVICE_CURRENT: u8 = 0x15;
pub const DEVICE_PIEZO: u8 = 0x16;
pub const DEVICE_RGB_LED: u8 = 0x17;
pub const DEVICE_TILT: u8 = 0x22;
pub const DEVICE_DISTANCE: u8 = 0x23;

// ============================================================================
// Parameter Ranges
// ============================================================================

pub const MOTOR_POWER_MIN: i32 = -100;
pub const MOTOR_POWER_MAX: i32 = 100;
pub const LED_INDEX_MAX: u8 = 10;

// ============================================================================
// Error Codes
// ============================================================================

pub const ERR_UNKNOWN_COMMAND: u8 = 0x01;
pub const ERR_INVALID_PORT: u8 = 0x02;
pub const ERR_INVALID_PARAMETER: u8 = 0x03;
pub const ERR_BUSY: u8 = 0x04;
pub const ERR_OVERCURRENT: u8 = 0x05;

// ============================================================================
// Table Types
// ============================================================================

/// Frame checksum rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// XOR of every byte.
    Xor,
    /// `0xFF` minus the wrapping byte sum.
    Complement,
}

impl Checksum {
    pub fn compute(self, bytes: &[u8]) -> u8 {
        match self {
            Checksum::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
            Checksum::Complement => 0xFF - bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
        }
    }
}

/// Transport endpoint a command is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    OutputCommand,
    InputCommand,
}

impl Endpoint {
    /// GATT characteristic a BLE transport maps this endpoint to.
    pub fn characteristic(self) -> &'static str {
        match self {
            Endpoint::OutputCommand => CHARACTERISTIC_OUTPUT_COMMAND,
            Endpoint::InputCommand => CHARACTERISTIC_INPUT_COMMAND,
        }
    }
}

/// Whether the hub echoes a correlation identifier for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Correlated,
    FireAndForget,
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeSpec {
    pub opcode: Opcode,
    pub code: u8,
    pub endpoint: Endpoint,
    pub ack: AckPolicy,
}

/// Kind of inbound message a type byte maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    PortAttached,
    PortDetached,
    PortInfo,
    SensorValue,
    CommandAck,
    Error,
}

/// Accepted payload length for an inbound type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Exact(usize),
    Range { min: usize, max: usize },
}

impl PayloadLen {
    pub fn accepts(self, len: usize) -> bool {
        match self {
            PayloadLen::Exact(n) => len == n,
            PayloadLen::Range { min, max } => (min..=max).contains(&len),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InboundSpec {
    pub kind: InboundKind,
    pub code: u8,
    pub payload: PayloadLen,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub name: &'static str,
    pub capabilities: Capabilities,
    /// `None` when the port is usable straight after attach.
    pub setup: Option<SetupProfile>,
    pub value: ValueFormat,
}

/// One hub family's complete wire description.
#[derive(Debug)]
pub struct ProtocolTable {
    pub name: &'static str,
    pub version: u16,
    pub port_count: u8,
    pub min_frame_len: usize,
    pub max_frame_len: usize,
    pub checksum: Checksum,
    pub outbound: &'static [OpcodeSpec],
    pub inbound: &'static [InboundSpec],
    pub devices: &'static [DeviceSpec],
    pub errors: &'static [(u8, &'static str)],
}

impl ProtocolTable {
    pub fn opcode(&self, opcode: Opcode) -> Option<&OpcodeSpec> {
        self.outbound.iter().find(|spec| spec.opcode == opcode)
    }

    pub fn opcode_by_code(&self, code: u8) -> Option<&OpcodeSpec> {
        self.outbound.iter().find(|spec| spec.code == code)
    }

    pub fn inbound(&self, code: u8) -> Option<&InboundSpec> {
        self.inbound.iter().find(|spec| spec.code == code)
    }

    pub fn device(&self, kind: DeviceKind) -> Option<&DeviceSpec> {
        self.devices.iter().find(|spec| spec.kind == kind)
    }

    /// Capabilities of `kind`; unknown kinds have none.
    pub fn capabilities(&self, kind: DeviceKind) -> Capabilities {
        self.device(kind)
            .map(|spec| spec.capabilities)
            .unwrap_or(Capabilities::NONE)
    }

    pub fn device_name(&self, kind: DeviceKind) -> &'static str {
        self.device(kind).map(|spec| spec.name).unwrap_or("unknown")
    }

    pub fn error_name(&self, code: u8) -> &'static str {
        self.errors
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .unwrap_or("unknown error")
    }

    pub fn is_port(&self, port: u8) -> bool {
        port < self.port_count
    }
}

// ============================================================================
// WeDo 2.0, table version 1
// ============================================================================

const MOTOR_CAPS: Capabilities = Capabilities::ACCEPTS_POWER;
const LED_CAPS: Capabilities = Capabilities::ACCEPTS_COLOR;
const TILT_CAPS: Capabilities = Capabilities::REPORTS_VALUE.union(Capabilities::REPORTS_TILT);
const DISTANCE_CAPS: Capabilities =
    Capabilities::REPORTS_VALUE.union(Capabilities::REPORTS_DISTANCE);

pub static WEDO2_V1: ProtocolTable = ProtocolTable {
    name: "wedo2",
    version: 1,
    port_count: WEDO2_PORT_COUNT,
    min_frame_len: MIN_FRAME_LEN,
    max_frame_len: MAX_FRAME_LEN,
    checksum: Checksum::Xor,
    outbound: &[
        OpcodeSpec {
            opcode: Opcode::MotorPower,
            code: MSG_MOTOR_POWER,
            endpoint: Endpoint::OutputCommand,
            ack: AckPolicy::Correlated,
        },
        OpcodeSpec {
            opcode: Opcode::PortSetup,
            code: MSG_PORT_SETUP,
            endpoint: Endpoint::InputCommand,
            ack: AckPolicy::Correlated,
        },
        OpcodeSpec {
            opcode: Opcode::LedRgb,
            code: MSG_LED_RGB,
            endpoint: Endpoint::OutputCommand,
            ack: AckPolicy::FireAndForget,
        },
        OpcodeSpec {
            opcode: Opcode::LedIndex,
            code: MSG_LED_INDEX,
            endpoint: Endpoint::OutputCommand,
            ack: AckPolicy::FireAndForget,
        },
    ],
    inbound: &[
        InboundSpec {
            kind: InboundKind::PortAttached,
            code: MSG_PORT_ATTACHED,
            payload: PayloadLen::Exact(1),
        },
        InboundSpec {
            kind: InboundKind::PortDetached,
            code: MSG_PORT_DETACHED,
            payload: PayloadLen::Exact(0),
        },
        InboundSpec {
            kind: InboundKind::Error,
            code: MSG_ERROR,
            payload: PayloadLen::Exact(2),
        },
        InboundSpec {
            kind: InboundKind::SensorValue,
            code: MSG_SENSOR_VALUE,
            payload: PayloadLen::Range { min: 1, max: 8 },
        },
        InboundSpec {
            kind: InboundKind::PortInfo,
            code: MSG_PORT_INFO,
            payload: PayloadLen::Exact(2),
        },
        InboundSpec {
            kind: InboundKind::CommandAck,
            code: MSG_COMMAND_ACK,
            payload: PayloadLen::Exact(1),
        },
    ],
    devices: &[
        DeviceSpec {
            kind: DeviceKind::MOTOR,
            name: "motor",
            capabilities: MOTOR_CAPS,
            setup: Some(SetupProfile {
                mode: 0x02,
                format: 0x00,
                delta: 1,
                notify: true,
            }),
            value: ValueFormat::Raw,
        },
        DeviceSpec {
            kind: DeviceKind::VOLTAGE,
            name: "voltage",
            capabilities: Capabilities::REPORTS_VALUE,
            setup: None,
            value: ValueFormat::Raw,
        },
        DeviceSpec {
            kind: DeviceKind::CURRENT,
            name: "current",
            capabilities: Capabilities::REPORTS_VALUE,
            setup: None,
            value: ValueFormat::Raw,
        },
        DeviceSpec {
            kind: DeviceKind::PIEZO,
            name: "piezo",
            capabilities: Capabilities::NONE,
            setup: None,
            value: ValueFormat::Raw,
        },
        DeviceSpec {
            kind: DeviceKind::RGB_LED,
            name: "rgb-led",
            capabilities: LED_CAPS,
            setup: None,
            value: ValueFormat::Raw,
        },
        DeviceSpec {
            kind: DeviceKind::TILT,
            name: "tilt",
            capabilities: TILT_CAPS,
            setup: Some(SetupProfile {
                mode: 0x00,
                format: 0x00,
                delta: 1,
                notify: true,
            }),
            value: ValueFormat::Tilt,
        },
        DeviceSpec {
            kind: DeviceKind::DISTANCE,
            name: "distance",
            capabilities: DISTANCE_CAPS,
            setup: Some(SetupProfile {
                mode: 0x01,
                format: 0x00,
                delta: 1,
                notify: true,
            }),
            value: ValueFormat::Distance,
        },
    ],
    errors: &[
        (ERR_UNKNOWN_COMMAND, "unknown command"),
        (ERR_INVALID_PORT, "invalid port"),
        (ERR_INVALID_PARAMETER, "invalid parameter"),
        (ERR_BUSY, "busy"),
        (ERR_OVERCURRENT, "overcurrent"),
    ],
};
