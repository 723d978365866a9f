//! Protocol module - WeDo hub wire format.

pub mod codec;
pub mod command;
pub mod constants;
pub mod message;

pub use codec::{DecodeError, EncodeError, FrameCodec, MalformedReason};
pub use command::{Command, CommandKind, Opcode};
pub use constants::{AckPolicy, Endpoint, ProtocolTable, WEDO2_V1};
pub use message::Message;
