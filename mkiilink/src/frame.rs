//! Frames exchanged between the nodes of a sensor unit
//!
//! A [Frame] is one self-delimited message: where it is going, what its payload
//! means, the payload itself and the sender's timestamp. The wire layout is the
//! business of the [codec](crate::codec) module; everything here is
//! format-agnostic.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

/// Default capacity of an on-device decoder
pub const FRAME_MAX_SIZE: usize = 2048;

/// Decoder capacity used by the host, large enough for audio captures
pub const HOST_FRAME_MAX_SIZE: usize = 1 << 20;

/// Size of an encoded format A frame with an empty payload and no escapes
pub const FRAME_MIN_SIZE: usize = 19;

/// Routing target of a frame among the physical nodes
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Deserialize, Serialize,
)]
#[repr(u8)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    /// The host, reached over USB
    Base = 0,
    /// The main application processor (H7)
    ApplicationProcessor = 1,
    /// The power supervisor / battery management board
    BatteryManagementSystem = 2,
}

impl Destination {
    /// Wire value of the destination
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Payload interpretation of a frame
///
/// Values outside the known set are kept as [FrameType::Reserved] so that a
/// router can still forward them untouched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    DebugString,
    /// Typically JSON
    DataString,
    BootloaderBinary,
    ApplicationProtobuf,
    BaseProtobuf,
    BmsProtobuf,
    BinaryAudio,
    Ack,
    Nack,
    Hello,
    DebugStringBms,
    StatsReportV7,
    Reserved(u32),
}

impl FrameType {
    /// Wire value of the frame type
    pub fn as_u32(self) -> u32 {
        u32::from(self)
    }

    /// Whether the payload is human readable debug output
    pub fn is_debug(self) -> bool {
        matches!(self, FrameType::DebugString | FrameType::DebugStringBms)
    }
}

impl From<u32> for FrameType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => FrameType::DebugString,
            1 => FrameType::DataString,
            2 => FrameType::BootloaderBinary,
            3 => FrameType::ApplicationProtobuf,
            4 => FrameType::BaseProtobuf,
            5 => FrameType::BmsProtobuf,
            6 => FrameType::BinaryAudio,
            7 => FrameType::Ack,
            8 => FrameType::Nack,
            9 => FrameType::Hello,
            10 => FrameType::DebugStringBms,
            11 => FrameType::StatsReportV7,
            other => FrameType::Reserved(other),
        }
    }
}

impl From<FrameType> for u32 {
    fn from(ty: FrameType) -> Self {
        match ty {
            FrameType::DebugString => 0,
            FrameType::DataString => 1,
            FrameType::BootloaderBinary => 2,
            FrameType::ApplicationProtobuf => 3,
            FrameType::BaseProtobuf => 4,
            FrameType::BmsProtobuf => 5,
            FrameType::BinaryAudio => 6,
            FrameType::Ack => 7,
            FrameType::Nack => 8,
            FrameType::Hello => 9,
            FrameType::DebugStringBms => 10,
            FrameType::StatsReportV7 => 11,
            FrameType::Reserved(other) => other,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Reserved(raw) => write!(f, "reserved({raw})"),
            other => write!(f, "{other:?}"),
        }
    }
}

bitflags! {
    /// Decode-time diagnostics, never serialized
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        const FRAME_FOUND = 0x01;
        const PARTIAL     = 0x02;
        const NO_PAYLOAD  = 0x04;
        const CRC_ERROR   = 0x08;
    }
}

/// One protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub destination: Destination,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
    /// Sender-local microsecond clock, informational only
    pub timestamp_us: u64,
    /// Integrity value carried on the wire, filled in by the decoder
    pub crc: u32,
    pub flags: FrameFlags,
}

impl Frame {
    pub fn new(destination: Destination, frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            destination,
            frame_type,
            payload: payload.into(),
            timestamp_us: 0,
            crc: 0,
            flags: FrameFlags::empty(),
        }
    }

    /// A frame carrying no payload, as used for acknowledgements and greetings
    pub fn empty(destination: Destination, frame_type: FrameType) -> Self {
        Self::new(destination, frame_type, Vec::new())
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == FrameType::Ack
    }

    pub fn is_nack(&self) -> bool {
        self.frame_type == FrameType::Nack
    }

    /// Whether the integrity check passed when this frame was decoded
    pub fn is_valid(&self) -> bool {
        !self.flags.contains(FrameFlags::CRC_ERROR)
    }

    /// The payload as text, with trailing NULs and line endings removed
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches(['\0', '\r', '\n'])
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn frame_type_wire_values_are_stable() {
        for raw in 0..=11u32 {
            let ty = FrameType::from(raw);
            assert!(!matches!(ty, FrameType::Reserved(_)), "{raw} should be known");
            assert_eq!(u32::from(ty), raw);
        }

        assert_eq!(FrameType::from(0x1234), FrameType::Reserved(0x1234));
        assert_eq!(FrameType::Reserved(0x1234).as_u32(), 0x1234);
    }

    #[test]
    fn destinations_round_trip_through_repr() {
        for dest in Destination::iter() {
            assert_eq!(Destination::from_repr(dest.as_u8()), Some(dest));
        }
        assert_eq!(Destination::from_repr(3), None);
    }

    #[test]
    fn text_trims_terminators() {
        let frame = Frame::new(Destination::Base, FrameType::DebugString, &b"hello\r\n\0"[..]);
        assert_eq!(frame.text(), "hello");
    }
}
