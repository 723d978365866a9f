//! Typed device wrappers over [`Hub`](crate::hub::Hub) commands.

pub mod led;
pub mod motor;
pub mod sensor;

pub use led::{Led, NAMED_COLORS};
pub use motor::Motor;
pub use sensor::{DistanceSensor, TiltSensor};
