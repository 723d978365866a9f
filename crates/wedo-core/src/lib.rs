//! WeDo-Core: protocol and port management for WeDo 2.0 style hubs.
//!
//! This crate speaks the hub's binary frame protocol, tracks which device
//! sits on each port, and turns caller requests into acknowledged commands.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frame codec, command and message types, the versioned
//!   protocol table
//! - **Port**: Per-port state machine and the registry that owns it
//! - **Dispatch**: Correlation ids, ack matching, timeouts and write retries
//! - **Router**: Fans decoded notifications out to the registry, the
//!   dispatcher and value observers
//! - **Transport**: Radio link abstraction (mock included)
//! - **Events**: Observer pattern for UI decoupling
//! - **Hub / Manager**: High-level orchestrators
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wedo_core::{Manager, ManagerConfig, MockScanner};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let scanner = Arc::new(MockScanner::new());
//! scanner.add_hub("00:16:53:A1:B2:C3", "WeDo 2.0 Hub");
//!
//! let mut manager = Manager::new(scanner, ManagerConfig::default());
//! let hubs = manager.discover().await?;
//! let hub = hubs[0].clone();
//! tokio::spawn({
//!     let hub = hub.clone();
//!     async move { hub.run().await }
//! });
//!
//! let motor = hub.motor(1)?;
//! motor.set_power(50).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod devices;
pub mod dispatch;
pub mod events;
pub mod hub;
pub mod manager;
pub mod port;
pub mod protocol;
pub mod router;
pub mod transport;

// Re-exports for convenience
pub use config::{HubConfig, ManagerConfig, QueueMode};
pub use device::{Capabilities, Device, DeviceId, DeviceKind, TiltDirection, Value};
pub use devices::{DistanceSensor, Led, Motor, TiltSensor};
pub use dispatch::{Ack, CommandDispatcher, DispatchError, Submission};
pub use events::{HubEvent, HubObserver, LogLevel, NullObserver, TracingObserver};
pub use hub::{Hub, RunExit};
pub use manager::{Manager, ManagerError};
pub use port::{PortRegistry, PortState, RegistryError};
pub use protocol::{
    Command, CommandKind, DecodeError, EncodeError, FrameCodec, Message, Opcode, WEDO2_V1,
};
pub use router::Subscription;
pub use transport::{
    HubDescriptor, HubScanner, HubTransport, MockScanner, MockTransport, TransportError,
};
