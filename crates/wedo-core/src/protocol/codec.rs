//! Frame codec: commands to bytes, bytes to messages.
//!
//! Wire layout, both directions:
//!
//! ```text
//! [len][type][port][payload...][checksum]
//! ```
//!
//! `len` counts the whole frame including itself and the checksum. Correlated
//! outbound opcodes carry their correlation identifier as the first payload
//! byte. Type bytes, payload sizes and the checksum rule come from the
//! [`ProtocolTable`] the codec was built with.
//!
//! The codec holds no buffer state. [`FrameCodec::decode`] works on a slice
//! that starts at a frame; the [`Decoder`] implementation additionally
//! resynchronises a byte stream after garbage.

use std::fmt;
use std::io;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::command::{Command, CommandKind, Opcode};
use super::constants::{
    AckPolicy, Endpoint, FRAME_HEADER_LEN, InboundKind, LED_INDEX_MAX, MOTOR_POWER_MAX,
    MOTOR_POWER_MIN, OpcodeSpec, ProtocolTable, WEDO2_V1,
};
use super::message::Message;
use crate::device::DeviceKind;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid parameter {name}={value}: expected {min}..={max}")]
    InvalidParameter {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("Opcode {opcode} is not defined by protocol table {table}")]
    UnsupportedOpcode { opcode: Opcode, table: &'static str },
    #[error("Message {name} is not defined by protocol table {table}")]
    UnsupportedMessage {
        name: &'static str,
        table: &'static str,
    },
    #[error("Opcode {0} requires a correlation identifier")]
    MissingCorrelation(Opcode),
    #[error("Frame too long: {len} bytes, maximum {max}")]
    FrameTooLong { len: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    BadLength(u8),
    UnknownType(u8),
    BadPort(u8),
    BadChecksum { expected: u8, actual: u8 },
    BadPayload { code: u8, len: usize },
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::BadLength(len) => write!(f, "length byte {}", len),
            MalformedReason::UnknownType(code) => write!(f, "unknown type 0x{:02X}", code),
            MalformedReason::BadPort(port) => write!(f, "port {} out of range", port),
            MalformedReason::BadChecksum { expected, actual } => write!(
                f,
                "checksum 0x{:02X}, expected 0x{:02X}",
                actual, expected
            ),
            MalformedReason::BadPayload { code, len } => {
                write!(f, "{} payload byte(s) for type 0x{:02X}", len, code)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },
    /// `discarded` is how many bytes a stream decoder drops to reach the next
    /// plausible frame boundary.
    #[error("Malformed frame ({reason}), {discarded} byte(s) discarded")]
    Malformed {
        reason: MalformedReason,
        discarded: usize,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete { .. })
    }
}

/// Space separated hex for log fields.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn knows(self, table: &ProtocolTable, code: u8) -> bool {
        match self {
            Direction::Inbound => table.inbound(code).is_some(),
            Direction::Outbound => table.opcode_by_code(code).is_some(),
        }
    }
}

enum Fault {
    Incomplete { needed: usize, available: usize },
    Malformed(MalformedReason),
}

struct RawFrame<'a> {
    code: u8,
    port: u8,
    payload: &'a [u8],
    len: usize,
}

/// Stateless encoder/decoder bound to one protocol table.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    table: &'static ProtocolTable,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&WEDO2_V1)
    }
}

impl FrameCodec {
    pub const fn new(table: &'static ProtocolTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &'static ProtocolTable {
        self.table
    }

    fn spec(&self, opcode: Opcode) -> Result<&'static OpcodeSpec, EncodeError> {
        self.table
            .opcode(opcode)
            .ok_or(EncodeError::UnsupportedOpcode {
                opcode,
                table: self.table.name,
            })
    }

    pub fn ack_policy(&self, opcode: Opcode) -> Option<AckPolicy> {
        self.table.opcode(opcode).map(|spec| spec.ack)
    }

    pub fn endpoint(&self, opcode: Opcode) -> Option<Endpoint> {
        self.table.opcode(opcode).map(|spec| spec.endpoint)
    }

    /// Check every parameter of `command` against the table's ranges.
    pub fn validate(&self, command: &Command) -> Result<(), EncodeError> {
        self.spec(command.opcode())?;
        check_range(
            "port",
            i64::from(command.port()),
            0,
            i64::from(self.table.port_count) - 1,
        )?;
        match command.kind() {
            CommandKind::MotorPower { power } => check_range(
                "power",
                i64::from(*power),
                i64::from(MOTOR_POWER_MIN),
                i64::from(MOTOR_POWER_MAX),
            ),
            CommandKind::LedIndex { index } => {
                check_range("index", i64::from(*index), 0, i64::from(LED_INDEX_MAX))
            }
            CommandKind::PortSetup { .. } | CommandKind::LedRgb { .. } => Ok(()),
        }
    }

    /// Encode `command` into one frame.
    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, EncodeError> {
        self.validate(command)?;
        let spec = self.spec(command.opcode())?;

        let mut frame = Vec::with_capacity(16);
        frame.push(0); // length, patched below
        frame.push(spec.code);
        frame.push(command.port());

        if spec.ack == AckPolicy::Correlated {
            let id = command
                .correlation()
                .ok_or(EncodeError::MissingCorrelation(spec.opcode))?;
            frame.push(id);
        }

        match command.kind() {
            CommandKind::MotorPower { power } => {
                // Negative power goes out as two's complement (-50 -> 206).
                frame.write_i8(*power as i8)?;
            }
            CommandKind::PortSetup {
                kind,
                mode,
                format,
                delta,
                notify,
            } => {
                frame.write_u8(kind.code())?;
                frame.write_u8(*mode)?;
                frame.write_u32::<LittleEndian>(*delta)?;
                frame.write_u8(*format)?;
                frame.write_u8(u8::from(*notify))?;
            }
            CommandKind::LedRgb { red, green, blue } => {
                frame.extend_from_slice(&[*red, *green, *blue]);
            }
            CommandKind::LedIndex { index } => frame.push(*index),
        }

        self.finish_frame(frame)
    }

    /// Encode an inbound message the way a hub would send it.
    pub fn encode_message(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let kind = match message {
            Message::PortAttached { .. } => InboundKind::PortAttached,
            Message::PortDetached { .. } => InboundKind::PortDetached,
            Message::PortInfo { .. } => InboundKind::PortInfo,
            Message::SensorValue { .. } => InboundKind::SensorValue,
            Message::CommandAck { .. } => InboundKind::CommandAck,
            Message::Error { .. } => InboundKind::Error,
        };
        let spec = self
            .table
            .inbound
            .iter()
            .find(|spec| spec.kind == kind)
            .ok_or(EncodeError::UnsupportedMessage {
                name: message.name(),
                table: self.table.name,
            })?;

        let mut frame = vec![0, spec.code, message.port()];
        match message {
            Message::PortAttached { kind, .. } => frame.push(kind.code()),
            Message::PortDetached { .. } => {}
            Message::PortInfo { mode, format, .. } => frame.extend_from_slice(&[*mode, *format]),
            Message::SensorValue { payload, .. } => frame.extend_from_slice(payload),
            Message::CommandAck { correlation, .. } => frame.push(*correlation),
            Message::Error {
                correlation, code, ..
            } => frame.extend_from_slice(&[*correlation, *code]),
        }
        self.finish_frame(frame)
    }

    /// Patch the length byte and append the checksum.
    fn finish_frame(&self, mut frame: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
        let len = frame.len() + 1;
        if len > self.table.max_frame_len {
            return Err(EncodeError::FrameTooLong {
                len,
                max: self.table.max_frame_len,
            });
        }
        frame[0] = len as u8;
        frame.push(self.table.checksum.compute(&frame));
        Ok(frame)
    }

    /// Decode the frame at the start of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        self.decode_frame(bytes).map(|(message, _)| message)
    }

    /// Decode the frame at the start of `bytes`, returning its length too.
    pub fn decode_frame(&self, bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
        self.parse_message(bytes)
            .map_err(|fault| self.fault_error(fault, bytes, Direction::Inbound))
    }

    /// Decode an outbound (host to hub) frame back into a [`Command`].
    pub fn decode_command(&self, bytes: &[u8]) -> Result<Command, DecodeError> {
        self.parse_command(bytes)
            .map(|(command, _)| command)
            .map_err(|fault| self.fault_error(fault, bytes, Direction::Outbound))
    }

    /// Bytes to skip from the start of `bytes` to reach the next position
    /// that could begin an inbound frame.
    pub fn resync_offset(&self, bytes: &[u8]) -> usize {
        self.resync(bytes, Direction::Inbound)
    }

    fn resync(&self, bytes: &[u8], direction: Direction) -> usize {
        (1..bytes.len())
            .find(|&offset| self.plausible(&bytes[offset..], direction))
            .unwrap_or(bytes.len())
    }

    fn plausible(&self, bytes: &[u8], direction: Direction) -> bool {
        let result = match direction {
            Direction::Inbound => self.parse_message(bytes).map(|_| ()),
            Direction::Outbound => self.parse_command(bytes).map(|_| ()),
        };
        !matches!(result, Err(Fault::Malformed(_)))
    }

    fn fault_error(&self, fault: Fault, bytes: &[u8], direction: Direction) -> DecodeError {
        match fault {
            Fault::Incomplete { needed, available } => {
                DecodeError::Incomplete { needed, available }
            }
            Fault::Malformed(reason) => DecodeError::Malformed {
                reason,
                discarded: self.resync(bytes, direction),
            },
        }
    }

    fn split<'a>(&self, bytes: &'a [u8], direction: Direction) -> Result<RawFrame<'a>, Fault> {
        let table = self.table;
        let Some(&len_byte) = bytes.first() else {
            return Err(Fault::Incomplete {
                needed: table.min_frame_len,
                available: 0,
            });
        };

        let len = usize::from(len_byte);
        if len < table.min_frame_len || len > table.max_frame_len {
            return Err(Fault::Malformed(MalformedReason::BadLength(len_byte)));
        }
        if let Some(&code) = bytes.get(1) {
            if !direction.knows(table, code) {
                return Err(Fault::Malformed(MalformedReason::UnknownType(code)));
            }
        }
        if let Some(&port) = bytes.get(2) {
            if !table.is_port(port) {
                return Err(Fault::Malformed(MalformedReason::BadPort(port)));
            }
        }
        if bytes.len() < len {
            return Err(Fault::Incomplete {
                needed: len,
                available: bytes.len(),
            });
        }

        let frame = &bytes[..len];
        let expected = table.checksum.compute(&frame[..len - 1]);
        let actual = frame[len - 1];
        if expected != actual {
            return Err(Fault::Malformed(MalformedReason::BadChecksum {
                expected,
                actual,
            }));
        }

        Ok(RawFrame {
            code: frame[1],
            port: frame[2],
            payload: &frame[FRAME_HEADER_LEN..len - 1],
            len,
        })
    }

    fn parse_message(&self, bytes: &[u8]) -> Result<(Message, usize), Fault> {
        let raw = self.split(bytes, Direction::Inbound)?;
        let bad_payload = || {
            Fault::Malformed(MalformedReason::BadPayload {
                code: raw.code,
                len: raw.payload.len(),
            })
        };
        let spec = self
            .table
            .inbound(raw.code)
            .ok_or(Fault::Malformed(MalformedReason::UnknownType(raw.code)))?;
        if !spec.payload.accepts(raw.payload.len()) {
            return Err(bad_payload());
        }

        let port = raw.port;
        let p = raw.payload;
        let message = match spec.kind {
            InboundKind::PortAttached => Message::PortAttached {
                port,
                kind: DeviceKind(p[0]),
            },
            InboundKind::PortDetached => Message::PortDetached { port },
            InboundKind::PortInfo => Message::PortInfo {
                port,
                mode: p[0],
                format: p[1],
            },
            InboundKind::SensorValue => Message::SensorValue {
                port,
                payload: p.to_vec(),
            },
            InboundKind::CommandAck => Message::CommandAck {
                port,
                correlation: p[0],
            },
            InboundKind::Error => Message::Error {
                port,
                correlation: p[0],
                code: p[1],
            },
        };
        Ok((message, raw.len))
    }

    fn parse_command(&self, bytes: &[u8]) -> Result<(Command, usize), Fault> {
        let raw = self.split(bytes, Direction::Outbound)?;
        let bad_payload = || {
            Fault::Malformed(MalformedReason::BadPayload {
                code: raw.code,
                len: raw.payload.len(),
            })
        };
        let spec = self
            .table
            .opcode_by_code(raw.code)
            .ok_or(Fault::Malformed(MalformedReason::UnknownType(raw.code)))?;

        let mut p = raw.payload;
        let mut correlation = None;
        if spec.ack == AckPolicy::Correlated {
            let (&id, rest) = p.split_first().ok_or_else(bad_payload)?;
            correlation = Some(id);
            p = rest;
        }

        let kind = match (spec.opcode, p) {
            (Opcode::MotorPower, &[power]) => CommandKind::MotorPower {
                power: i32::from(power as i8),
            },
            (Opcode::PortSetup, &[kind, mode, _, _, _, _, format, notify]) => {
                CommandKind::PortSetup {
                    kind: DeviceKind(kind),
                    mode,
                    format,
                    delta: LittleEndian::read_u32(&p[2..6]),
                    notify: notify != 0,
                }
            }
            (Opcode::LedRgb, &[red, green, blue]) => CommandKind::LedRgb { red, green, blue },
            (Opcode::LedIndex, &[index]) => CommandKind::LedIndex { index },
            _ => return Err(bad_payload()),
        };

        let command = Command::new(raw.port, kind);
        let command = match correlation {
            Some(id) => command.with_correlation(id),
            None => command,
        };
        Ok((command, raw.len))
    }
}

fn check_range(name: &'static str, value: i64, min: i64, max: i64) -> Result<(), EncodeError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(EncodeError::InvalidParameter {
            name,
            value,
            min,
            max,
        })
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = FrameCodec::encode(self, &command)?;
        trace!(cmd = %command, frame = %HexBytes(&frame), "TX frame");
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = DecodeError;

    /// `Ok(None)` asks for more bytes. A malformed run is consumed before its
    /// error is returned, so a caller that keeps polling resumes at the next
    /// frame boundary with nothing lost.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match self.parse_message(src) {
            Ok((message, used)) => {
                trace!(msg = %message, frame = %HexBytes(&src[..used]), "RX frame");
                src.advance(used);
                Ok(Some(message))
            }
            Err(Fault::Incomplete { needed, available }) => {
                src.reserve(needed.saturating_sub(available));
                Ok(None)
            }
            Err(Fault::Malformed(reason)) => {
                let discarded = self.resync(src, Direction::Inbound);
                warn!(
                    %reason,
                    discarded,
                    bytes = %HexBytes(&src[..discarded]),
                    "Discarding malformed frame"
                );
                src.advance(discarded);
                Err(DecodeError::Malformed { reason, discarded })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use pretty_assertions::assert_eq;

    /// Wrap `body` (type, port, payload) with length and XOR checksum.
    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = vec![(body.len() + 2) as u8];
        out.extend_from_slice(body);
        out.push(Checksum::Xor.compute(&out));
        out
    }

    #[test]
    fn test_encode_motor_power() {
        let codec = FrameCodec::default();
        let cmd = Command::new(0, CommandKind::MotorPower { power: 50 }).with_correlation(1);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes, vec![0x06, MSG_MOTOR_POWER, 0x00, 0x01, 0x32, 0x34]);
    }

    #[test]
    fn test_encode_negative_power_twos_complement() {
        let codec = FrameCodec::default();
        let cmd = Command::new(1, CommandKind::MotorPower { power: -50 }).with_correlation(7);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes[4], 206);
    }

    #[test]
    fn test_power_out_of_range_is_rejected() {
        let codec = FrameCodec::default();
        let cmd = Command::new(0, CommandKind::MotorPower { power: 101 }).with_correlation(1);
        match codec.encode(&cmd) {
            Err(EncodeError::InvalidParameter { name, value, .. }) => {
                assert_eq!(name, "power");
                assert_eq!(value, 101);
            }
            other => panic!("expected InvalidParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_port_out_of_range_is_rejected() {
        let codec = FrameCodec::default();
        let cmd = Command::new(WEDO2_PORT_COUNT, CommandKind::LedIndex { index: 3 });
        assert!(matches!(
            codec.encode(&cmd),
            Err(EncodeError::InvalidParameter { name: "port", .. })
        ));
    }

    #[test]
    fn test_led_rgb_has_no_correlation_byte() {
        let codec = FrameCodec::default();
        let cmd = Command::new(
            6,
            CommandKind::LedRgb {
                red: 0xFF,
                green: 0,
                blue: 0,
            },
        );
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes, vec![0x07, MSG_LED_RGB, 0x06, 0xFF, 0x00, 0x00, 0xFA]);
    }

    #[test]
    fn test_correlated_opcode_requires_id() {
        let codec = FrameCodec::default();
        let cmd = Command::new(0, CommandKind::MotorPower { power: 10 });
        assert!(matches!(
            codec.encode(&cmd),
            Err(EncodeError::MissingCorrelation(Opcode::MotorPower))
        ));
    }

    #[test]
    fn test_port_setup_decodes_back() {
        let codec = FrameCodec::default();
        let profile = WEDO2_V1.device(DeviceKind::DISTANCE).unwrap().setup.unwrap();
        let cmd = Command::new(2, CommandKind::setup(DeviceKind::DISTANCE, profile))
            .with_correlation(9);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(
            &bytes[..12],
            &[0x0D, MSG_PORT_SETUP, 0x02, 0x09, 0x23, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(codec.decode_command(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_decode_port_attached() {
        let codec = FrameCodec::default();
        let bytes = frame(&[MSG_PORT_ATTACHED, 1, DEVICE_TILT]);
        assert_eq!(bytes, vec![0x05, 0x01, 0x01, 0x22, 0x27]);
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            Message::PortAttached {
                port: 1,
                kind: DeviceKind::TILT
            }
        );
    }

    #[test]
    fn test_encode_message_matches_hub_framing() {
        let codec = FrameCodec::default();
        let message = Message::PortAttached {
            port: 1,
            kind: DeviceKind::TILT,
        };
        assert_eq!(
            codec.encode_message(&message).unwrap(),
            frame(&[MSG_PORT_ATTACHED, 1, DEVICE_TILT])
        );
    }

    #[test]
    fn test_decode_ack_and_error() {
        let codec = FrameCodec::default();
        assert_eq!(
            codec.decode(&frame(&[MSG_COMMAND_ACK, 0, 5])).unwrap(),
            Message::CommandAck {
                port: 0,
                correlation: 5
            }
        );
        assert_eq!(
            codec
                .decode(&frame(&[MSG_ERROR, 0, 5, ERR_BUSY]))
                .unwrap(),
            Message::Error {
                port: 0,
                correlation: 5,
                code: ERR_BUSY
            }
        );
    }

    #[test]
    fn test_decode_incomplete() {
        let codec = FrameCodec::default();
        let bytes = frame(&[MSG_PORT_ATTACHED, 1, DEVICE_TILT]);
        match codec.decode(&bytes[..3]) {
            Err(DecodeError::Incomplete { needed, available }) => {
                assert_eq!(needed, 5);
                assert_eq!(available, 3);
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
        assert!(codec.decode(&[]).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_decode_bad_checksum() {
        let codec = FrameCodec::default();
        let mut bytes = frame(&[MSG_PORT_DETACHED, 1]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&bytes),
            Err(DecodeError::Malformed {
                reason: MalformedReason::BadChecksum { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_decode_unknown_type_and_bad_payload() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&frame(&[0x99, 0])),
            Err(DecodeError::Malformed {
                reason: MalformedReason::UnknownType(0x99),
                ..
            })
        ));
        assert!(matches!(
            codec.decode(&frame(&[MSG_COMMAND_ACK, 0])),
            Err(DecodeError::Malformed {
                reason: MalformedReason::BadPayload { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_decode_is_total() {
        // Every short byte pattern yields a message or a typed error.
        let codec = FrameCodec::default();
        for first in 0..=255u8 {
            for second in [0x00, MSG_SENSOR_VALUE, MSG_COMMAND_ACK, 0xFF] {
                let bytes = [first, second, 0x01, first.wrapping_mul(3), 0x10, 0x20];
                let once = format!("{:?}", codec.decode(&bytes));
                let twice = format!("{:?}", codec.decode(&bytes));
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn test_stream_resyncs_after_garbage() {
        let mut codec = FrameCodec::default();
        let first = frame(&[MSG_PORT_ATTACHED, 0, DEVICE_MOTOR]);
        let second = frame(&[MSG_COMMAND_ACK, 0, 3]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&[0xFF, 0xFF]);
        buf.extend_from_slice(&second);

        let mut messages = Vec::new();
        let mut malformed = 0;
        loop {
            match Decoder::decode(&mut codec, &mut buf) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(DecodeError::Malformed { discarded, .. }) => {
                    assert_eq!(discarded, 2);
                    malformed += 1;
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }

        assert_eq!(malformed, 1);
        assert_eq!(
            messages,
            vec![
                Message::PortAttached {
                    port: 0,
                    kind: DeviceKind::MOTOR
                },
                Message::CommandAck {
                    port: 0,
                    correlation: 3
                },
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resync_offset() {
        let codec = FrameCodec::default();
        let mut bytes = vec![0xFF, 0x00];
        bytes.extend(frame(&[MSG_COMMAND_ACK, 2, 9]));
        assert_eq!(codec.resync_offset(&bytes), 2);
        assert_eq!(codec.resync_offset(&[0xFF, 0xFF, 0xFF]), 3);
    }

    #[test]
    fn test_stream_waits_for_split_frame() {
        let mut codec = FrameCodec::default();
        let bytes = frame(&[MSG_SENSOR_VALUE, 1, 0x10, 0x20]);
        let mut buf = BytesMut::from(&bytes[..2]);
        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[2..]);
        assert_eq!(
            Decoder::decode(&mut codec, &mut buf).unwrap(),
            Some(Message::SensorValue {
                port: 1,
                payload: vec![0x10, 0x20]
            })
        );
    }

    #[test]
    fn test_encoder_appends_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let cmd = Command::new(6, CommandKind::LedIndex { index: 3 });
        Encoder::encode(&mut codec, cmd.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode_command(&buf).unwrap(), cmd);
    }
}
