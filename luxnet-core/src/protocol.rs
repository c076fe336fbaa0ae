//! Bus message set: kind-code layout, fields, values, and the tagged [`Message`] mapped
//! onto [`Frame`]s.
//!
//! Every addressed message carries its destination in payload byte 0; values follow at
//! offset 1. Floats are IEEE-754 little-endian.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;
use crate::wire::Frame;

/// Numeric layout of the 6-bit kind field. Families are disjoint ranges.
pub mod kind {
    use std::ops::RangeInclusive;

    pub const REQUEST_TURN: u8 = 0x01;
    pub const TURN_ACK: u8 = 0x02;
    pub const LOW_LIGHT: u8 = 0x03;
    pub const HIGH_LIGHT: u8 = 0x04;
    pub const DONE_LIGHT: u8 = 0x05;
    pub const CALIBRATION_DONE: u8 = 0x06;
    pub const CALIBRATION: RangeInclusive<u8> = REQUEST_TURN..=CALIBRATION_DONE;

    /// Reserved for boot broadcasts. With address 0 this is identifier 0x100.
    pub const BOOT: u8 = 0x08;

    pub const GET_BASE: u8 = 0x10;
    pub const GET: RangeInclusive<u8> = 0x10..=0x1F;
    pub const SET_BASE: u8 = 0x20;
    pub const SET: RangeInclusive<u8> = 0x20..=0x2F;
    pub const STREAM_START_BASE: u8 = 0x30;
    pub const STREAM_START: RangeInclusive<u8> = 0x30..=0x34;
    pub const STREAM_STOP_BASE: u8 = 0x35;
    pub const STREAM_STOP: RangeInclusive<u8> = 0x35..=0x39;
    pub const ACK: u8 = 0x3A;
    pub const ERROR: u8 = 0x3B;
}

/// Kind family, derived from the numeric range of a kind code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Calibration,
    Boot,
    Get,
    Set,
    StreamStart,
    StreamStop,
    Ack,
    Error,
}

impl Family {
    pub fn of(code: u8) -> Option<Family> {
        match code {
            c if kind::CALIBRATION.contains(&c) => Some(Family::Calibration),
            kind::BOOT => Some(Family::Boot),
            c if kind::GET.contains(&c) => Some(Family::Get),
            c if kind::SET.contains(&c) => Some(Family::Set),
            c if kind::STREAM_START.contains(&c) => Some(Family::StreamStart),
            c if kind::STREAM_STOP.contains(&c) => Some(Family::StreamStop),
            kind::ACK => Some(Family::Ack),
            kind::ERROR => Some(Family::Error),
            _ => None,
        }
    }
}

/// How a field's value travels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 4-byte float.
    Float,
    /// 1-byte boolean (0/1).
    Flag,
}

impl ValueType {
    pub fn encoded_len(self) -> usize {
        match self {
            ValueType::Float => 4,
            ValueType::Flag => 1,
        }
    }
}

/// Named quantity a console or a peer can read (and for some, write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Duty,
    Reference,
    Illuminance,
    Voltage,
    Occupancy,
    AntiWindup,
    Feedback,
    External,
    Power,
    Time,
    Energy,
    VisibilityError,
    Flicker,
    LowerBoundOccupied,
    LowerBoundUnoccupied,
    CurrentLowerBound,
}

impl Field {
    /// Wire order: a field's index is its offset inside the Get and Set ranges.
    pub const ALL: [Field; 16] = [
        Field::Duty,
        Field::Reference,
        Field::Illuminance,
        Field::Voltage,
        Field::Occupancy,
        Field::AntiWindup,
        Field::Feedback,
        Field::External,
        Field::Power,
        Field::Time,
        Field::Energy,
        Field::VisibilityError,
        Field::Flicker,
        Field::LowerBoundOccupied,
        Field::LowerBoundUnoccupied,
        Field::CurrentLowerBound,
    ];

    pub fn index(self) -> u8 {
        // ALL lists every variant in declaration order.
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Field> {
        Field::ALL.get(index as usize).copied()
    }

    /// Console letter.
    pub fn code(self) -> &'static str {
        match self {
            Field::Duty => "u",
            Field::Reference => "r",
            Field::Illuminance => "y",
            Field::Voltage => "v",
            Field::Occupancy => "o",
            Field::AntiWindup => "a",
            Field::Feedback => "f",
            Field::External => "d",
            Field::Power => "p",
            Field::Time => "t",
            Field::Energy => "E",
            Field::VisibilityError => "V",
            Field::Flicker => "F",
            Field::LowerBoundOccupied => "O",
            Field::LowerBoundUnoccupied => "U",
            Field::CurrentLowerBound => "L",
        }
    }

    pub fn from_code(code: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.code() == code)
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Field::Occupancy | Field::AntiWindup | Field::Feedback => ValueType::Flag,
            _ => ValueType::Float,
        }
    }

    pub fn is_settable(self) -> bool {
        matches!(
            self,
            Field::Duty
                | Field::Reference
                | Field::Occupancy
                | Field::AntiWindup
                | Field::Feedback
                | Field::LowerBoundOccupied
                | Field::LowerBoundUnoccupied
        )
    }

    /// Decimal places used when printing this field.
    pub fn precision(self) -> usize {
        match self {
            Field::Energy | Field::VisibilityError => 3,
            Field::Flicker => 6,
            _ => 2,
        }
    }

    /// Range check applied before a set is transmitted and again by the receiver.
    pub fn validate(self, value: Value) -> Result<(), ErrorCode> {
        if !self.is_settable() {
            return Err(ErrorCode::ReadOnly);
        }
        match (self.value_type(), value) {
            (ValueType::Flag, Value::Flag(_)) => Ok(()),
            (ValueType::Float, Value::Float(v)) => {
                if !v.is_finite() {
                    return Err(ErrorCode::OutOfRange);
                }
                let ok = match self {
                    // -1 hands the duty cycle back to the controller.
                    Field::Duty => (0.0..=1.0).contains(&v) || v == DUTY_RELEASE,
                    Field::LowerBoundOccupied | Field::LowerBoundUnoccupied => v > 0.0,
                    Field::Reference => v >= 0.0,
                    _ => true,
                };
                if ok {
                    Ok(())
                } else {
                    Err(ErrorCode::OutOfRange)
                }
            }
            _ => Err(ErrorCode::Malformed),
        }
    }
}

/// Duty-cycle sentinel that leaves manual mode.
pub const DUTY_RELEASE: f32 = -1.0;

/// A field value as carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(f32),
    Flag(bool),
}

impl Value {
    fn encode_into(self, out: &mut Vec<u8>) {
        match self {
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Flag(b) => out.push(b as u8),
        }
    }

    fn decode(ty: ValueType, bytes: &[u8]) -> Option<Value> {
        match ty {
            ValueType::Float => {
                let raw: [u8; 4] = bytes.try_into().ok()?;
                Some(Value::Float(f32::from_le_bytes(raw)))
            }
            ValueType::Flag => match bytes {
                [b] => Some(Value::Flag(*b != 0)),
                _ => None,
            },
        }
    }

    /// Render with the field's console precision.
    pub fn display(self, field: Field) -> String {
        match self {
            Value::Float(v) => format!("{:.*}", field.precision(), v),
            Value::Flag(b) => format!("{}", b as u8),
        }
    }
}

/// Stream selector for `s`/`S` console commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Duty,
    Illuminance,
    Reference,
    Voltage,
    All,
}

impl Stream {
    const ALL: [Stream; 5] = [
        Stream::Duty,
        Stream::Illuminance,
        Stream::Reference,
        Stream::Voltage,
        Stream::All,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Stream::Duty => "u",
            Stream::Illuminance => "y",
            Stream::Reference => "r",
            Stream::Voltage => "v",
            Stream::All => "all",
        }
    }

    pub fn from_code(code: &str) -> Option<Stream> {
        Stream::ALL.iter().copied().find(|s| s.code() == code)
    }

    fn index(self) -> u8 {
        self as u8
    }

    fn from_index(index: u8) -> Option<Stream> {
        Stream::ALL.get(index as usize).copied()
    }
}

/// Reason carried by an Error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    OutOfRange = 1,
    ReadOnly = 2,
    Malformed = 3,
}

impl ErrorCode {
    pub fn from_u8(raw: u8) -> ErrorCode {
        match raw {
            1 => ErrorCode::OutOfRange,
            2 => ErrorCode::ReadOnly,
            _ => ErrorCode::Malformed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::OutOfRange => "value out of range",
            ErrorCode::ReadOnly => "field is read-only",
            ErrorCode::Malformed => "malformed request",
        };
        f.write_str(s)
    }
}

/// Calibration step a turn acknowledgement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Turn = 0,
    Low = 1,
    High = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Option<Phase> {
        match raw {
            0 => Some(Phase::Turn),
            1 => Some(Phase::Low),
            2 => Some(Phase::High),
            _ => None,
        }
    }
}

/// Every message a node puts on, or takes off, the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Read request for `field` on node `to`.
    Get { to: NodeAddress, field: Field },
    /// Answer to a Get, addressed back to the requester.
    Value {
        to: NodeAddress,
        field: Field,
        value: Value,
    },
    Set {
        to: NodeAddress,
        field: Field,
        value: Value,
    },
    StreamStart(Stream),
    StreamStop(Stream),
    Ack { to: NodeAddress },
    Error { to: NodeAddress, code: ErrorCode },
    RequestTurn,
    TurnAck { to: NodeAddress, phase: Phase },
    LowLight,
    HighLight,
    DoneLight,
    CalibrationDone,
    /// Discovery announcement; the sender travels in the payload.
    Boot { node: NodeAddress },
}

/// Error decoding a frame into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("kind {kind:#04x} with unexpected payload length {len}")]
    BadLength { kind: u8, len: usize },
    #[error("kind {0:#04x} with unreadable payload")]
    BadPayload(u8),
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Get { field, .. } | Message::Value { field, .. } => {
                kind::GET_BASE + field.index()
            }
            Message::Set { field, .. } => kind::SET_BASE + field.index(),
            Message::StreamStart(s) => kind::STREAM_START_BASE + s.index(),
            Message::StreamStop(s) => kind::STREAM_STOP_BASE + s.index(),
            Message::Ack { .. } => kind::ACK,
            Message::Error { .. } => kind::ERROR,
            Message::RequestTurn => kind::REQUEST_TURN,
            Message::TurnAck { .. } => kind::TURN_ACK,
            Message::LowLight => kind::LOW_LIGHT,
            Message::HighLight => kind::HIGH_LIGHT,
            Message::DoneLight => kind::DONE_LIGHT,
            Message::CalibrationDone => kind::CALIBRATION_DONE,
            Message::Boot { .. } => kind::BOOT,
        }
    }

    /// Node this message is addressed to, if it is addressed at all.
    pub fn destination(&self) -> Option<NodeAddress> {
        match self {
            Message::Get { to, .. }
            | Message::Value { to, .. }
            | Message::Set { to, .. }
            | Message::Ack { to }
            | Message::Error { to, .. }
            | Message::TurnAck { to, .. } => Some(*to),
            _ => None,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        match self {
            Message::Get { to, .. } | Message::Ack { to } => out.push(to.get()),
            Message::Value { to, value, .. } | Message::Set { to, value, .. } => {
                out.push(to.get());
                value.encode_into(&mut out);
            }
            Message::Error { to, code } => {
                out.push(to.get());
                out.push(*code as u8);
            }
            Message::TurnAck { to, phase } => {
                out.push(to.get());
                out.push(*phase as u8);
            }
            Message::Boot { node } => out.push(node.get()),
            Message::StreamStart(_)
            | Message::StreamStop(_)
            | Message::RequestTurn
            | Message::LowLight
            | Message::HighLight
            | Message::DoneLight
            | Message::CalibrationDone => {}
        }
        out
    }

    /// Frame this message as sent by `source`. Boot frames always use identifier 0x100.
    pub fn to_frame(&self, source: NodeAddress) -> Frame {
        let source = match self {
            Message::Boot { .. } => NodeAddress::from_wire(0),
            _ => source,
        };
        Frame::new(self.kind(), source, self.payload())
    }

    /// Decode a frame. Returns the sending node with the message.
    pub fn from_frame(frame: &Frame) -> Result<(NodeAddress, Message), DecodeError> {
        let code = frame.kind;
        let p = frame.payload.as_slice();
        let bad_len = || DecodeError::BadLength {
            kind: code,
            len: p.len(),
        };
        let family = Family::of(code).ok_or(DecodeError::UnknownKind(code))?;
        let msg = match family {
            Family::Boot => match p {
                [node] if frame.source.get() == 0 => {
                    return Ok((
                        NodeAddress::from_wire(*node),
                        Message::Boot {
                            node: NodeAddress::from_wire(*node),
                        },
                    ));
                }
                [_] => return Err(DecodeError::UnknownKind(code)),
                _ => return Err(bad_len()),
            },
            Family::Get => {
                let field = Field::from_index(code - kind::GET_BASE)
                    .ok_or(DecodeError::UnknownKind(code))?;
                let (&to, rest) = p.split_first().ok_or_else(bad_len)?;
                let to = NodeAddress::from_wire(to);
                if rest.is_empty() {
                    Message::Get { to, field }
                } else if rest.len() == field.value_type().encoded_len() {
                    let value = Value::decode(field.value_type(), rest)
                        .ok_or(DecodeError::BadPayload(code))?;
                    Message::Value { to, field, value }
                } else {
                    return Err(bad_len());
                }
            }
            Family::Set => {
                let field = Field::from_index(code - kind::SET_BASE)
                    .filter(|f| f.is_settable())
                    .ok_or(DecodeError::UnknownKind(code))?;
                let (&to, rest) = p.split_first().ok_or_else(bad_len)?;
                if rest.len() != field.value_type().encoded_len() {
                    return Err(bad_len());
                }
                let value =
                    Value::decode(field.value_type(), rest).ok_or(DecodeError::BadPayload(code))?;
                Message::Set {
                    to: NodeAddress::from_wire(to),
                    field,
                    value,
                }
            }
            Family::StreamStart | Family::StreamStop => {
                if !p.is_empty() {
                    return Err(bad_len());
                }
                let base = if family == Family::StreamStart {
                    kind::STREAM_START_BASE
                } else {
                    kind::STREAM_STOP_BASE
                };
                let stream =
                    Stream::from_index(code - base).ok_or(DecodeError::UnknownKind(code))?;
                if family == Family::StreamStart {
                    Message::StreamStart(stream)
                } else {
                    Message::StreamStop(stream)
                }
            }
            Family::Ack => match p {
                [to] => Message::Ack {
                    to: NodeAddress::from_wire(*to),
                },
                _ => return Err(bad_len()),
            },
            Family::Error => match p {
                [to, reason] => Message::Error {
                    to: NodeAddress::from_wire(*to),
                    code: ErrorCode::from_u8(*reason),
                },
                _ => return Err(bad_len()),
            },
            Family::Calibration => match (code, p) {
                (kind::TURN_ACK, [to, phase]) => Message::TurnAck {
                    to: NodeAddress::from_wire(*to),
                    phase: Phase::from_u8(*phase).ok_or(DecodeError::BadPayload(code))?,
                },
                (kind::TURN_ACK, _) => return Err(bad_len()),
                (_, [_, ..]) => return Err(bad_len()),
                (kind::REQUEST_TURN, []) => Message::RequestTurn,
                (kind::LOW_LIGHT, []) => Message::LowLight,
                (kind::HIGH_LIGHT, []) => Message::HighLight,
                (kind::DONE_LIGHT, []) => Message::DoneLight,
                (kind::CALIBRATION_DONE, []) => Message::CalibrationDone,
                _ => return Err(DecodeError::UnknownKind(code)),
            },
        };
        Ok((frame.source, msg))
    }
}
