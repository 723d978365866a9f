//! Port lifecycle and the per-hub port table.

pub mod registry;
pub mod state;

pub use registry::{Admission, PortRegistry, QueuedCommand, RegistryError};
pub use state::{PortInfo, PortState};
