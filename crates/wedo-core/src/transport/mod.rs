//! Transport layer module.

pub mod mock;
pub mod traits;

pub use mock::{MockScanner, MockTransport};
pub use traits::{HubDescriptor, HubScanner, HubTransport, NotificationStream, TransportError};
