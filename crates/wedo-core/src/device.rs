//! Device model: kinds, capability flags, decoded values and device handles.
//!
//! A [`DeviceKind`] is just the type byte the hub reports on attach. What a
//! kind can do (capabilities, port setup, value format) lives in the protocol
//! table, so adding a device family never touches the codec or registry.

use std::fmt;
use std::io::Cursor;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::protocol::constants::{
    DEVICE_CURRENT, DEVICE_DISTANCE, DEVICE_MOTOR, DEVICE_PIEZO, DEVICE_RGB_LED, DEVICE_TILT,
    DEVICE_VOLTAGE,
};

/// Device type byte as reported by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKind(pub u8);

impl DeviceKind {
    pub const MOTOR: Self = Self(DEVICE_MOTOR);
    pub const VOLTAGE: Self = Self(DEVICE_VOLTAGE);
    pub const CURRENT: Self = Self(DEVICE_CURRENT);
    pub const PIEZO: Self = Self(DEVICE_PIEZO);
    pub const RGB_LED: Self = Self(DEVICE_RGB_LED);
    pub const TILT: Self = Self(DEVICE_TILT);
    pub const DISTANCE: Self = Self(DEVICE_DISTANCE);

    /// Raw type byte.
    pub const fn code(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Capability flags for a device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    /// Accepts the motor power command.
    pub const ACCEPTS_POWER: Self = Self(1 << 0);
    /// Accepts RGB and indexed colour commands.
    pub const ACCEPTS_COLOR: Self = Self(1 << 1);
    /// Streams sensor values.
    pub const REPORTS_VALUE: Self = Self(1 << 2);
    /// Streams tilt readings.
    pub const REPORTS_TILT: Self = Self(1 << 3);
    /// Streams distance readings.
    pub const REPORTS_DISTANCE: Self = Self(1 << 4);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Capabilities, &str); 5] = [
            (Capabilities::ACCEPTS_POWER, "power"),
            (Capabilities::ACCEPTS_COLOR, "color"),
            (Capabilities::REPORTS_VALUE, "value"),
            (Capabilities::REPORTS_TILT, "tilt"),
            (Capabilities::REPORTS_DISTANCE, "distance"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Input format the host requests when a port of this kind attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupProfile {
    pub mode: u8,
    pub format: u8,
    /// Minimum change between two value notifications.
    pub delta: u32,
    pub notify: bool,
}

/// How sensor payloads of a kind are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Raw,
    Tilt,
    Distance,
}

/// Tilt direction reported by the tilt sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltDirection {
    NoTilt,
    Back,
    Right,
    Forward,
    Left,
}

impl TiltDirection {
    /// Classify a raw tilt byte.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            11..=39 => TiltDirection::Back,
            61..=89 => TiltDirection::Right,
            171..=189 => TiltDirection::Forward,
            221..=239 => TiltDirection::Left,
            _ => TiltDirection::NoTilt,
        }
    }
}

impl fmt::Display for TiltDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TiltDirection::NoTilt => write!(f, "NO_TILT"),
            TiltDirection::Back => write!(f, "BACK"),
            TiltDirection::Right => write!(f, "RIGHT"),
            TiltDirection::Forward => write!(f, "FORWARD"),
            TiltDirection::Left => write!(f, "LEFT"),
        }
    }
}

/// Decoded sensor reading cached on a port.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tilt(TiltDirection),
    Distance(f32),
    Raw(Vec<u8>),
}

impl Value {
    /// Interpret a sensor payload according to `format`.
    ///
    /// Payloads that do not fit the expected shape fall back to `Raw`.
    pub fn decode(format: ValueFormat, payload: &[u8]) -> Self {
        match format {
            ValueFormat::Tilt => match payload.first() {
                Some(&raw) => Value::Tilt(TiltDirection::from_raw(raw)),
                None => Value::Raw(Vec::new()),
            },
            ValueFormat::Distance => match payload.len() {
                1 => Value::Distance(f32::from(payload[0])),
                4 => Cursor::new(payload)
                    .read_f32::<LittleEndian>()
                    .map(Value::Distance)
                    .unwrap_or_else(|_| Value::Raw(payload.to_vec())),
                _ => Value::Raw(payload.to_vec()),
            },
            ValueFormat::Raw => Value::Raw(payload.to_vec()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tilt(direction) => write!(f, "tilt {}", direction),
            Value::Distance(distance) => write!(f, "distance {:.1}", distance),
            Value::Raw(bytes) => write!(f, "raw {:02X?}", bytes),
        }
    }
}

/// Process-wide unique identity of a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Logical handle to whatever is plugged into one port.
///
/// The handle does not own the port: once the port detaches, the registry
/// drops the binding and every operation through this handle fails with
/// `DeviceDetached`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    port: u8,
    kind: DeviceKind,
    capabilities: Capabilities,
}

impl Device {
    pub(crate) fn new(port: u8, kind: DeviceKind, capabilities: Capabilities) -> Self {
        Self {
            id: DeviceId::next(),
            port,
            kind,
            capabilities,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tilt_classification() {
        assert_eq!(TiltDirection::from_raw(25), TiltDirection::Back);
        assert_eq!(TiltDirection::from_raw(75), TiltDirection::Right);
        assert_eq!(TiltDirection::from_raw(180), TiltDirection::Forward);
        assert_eq!(TiltDirection::from_raw(230), TiltDirection::Left);
        assert_eq!(TiltDirection::from_raw(130), TiltDirection::NoTilt);
        // Boundaries are exclusive.
        assert_eq!(TiltDirection::from_raw(10), TiltDirection::NoTilt);
        assert_eq!(TiltDirection::from_raw(40), TiltDirection::NoTilt);
    }

    #[test]
    fn test_distance_decoding() {
        assert_eq!(Value::decode(ValueFormat::Distance, &[7]), Value::Distance(7.0));
        let bytes = 12.5f32.to_le_bytes();
        assert_eq!(
            Value::decode(ValueFormat::Distance, &bytes),
            Value::Distance(12.5)
        );
        assert_eq!(
            Value::decode(ValueFormat::Distance, &[1, 2]),
            Value::Raw(vec![1, 2])
        );
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::ACCEPTS_POWER | Capabilities::REPORTS_VALUE;
        assert!(caps.contains(Capabilities::ACCEPTS_POWER));
        assert!(!caps.contains(Capabilities::ACCEPTS_COLOR));
        assert_eq!(caps.to_string(), "power|value");
        assert_eq!(Capabilities::NONE.to_string(), "-");
    }

    #[test]
    fn test_device_ids_are_unique() {
        let a = Device::new(0, DeviceKind::MOTOR, Capabilities::ACCEPTS_POWER);
        let b = Device::new(0, DeviceKind::MOTOR, Capabilities::ACCEPTS_POWER);
        assert_ne!(a.id(), b.id());
    }
}
