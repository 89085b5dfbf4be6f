//! Serializing frames to and from a byte stream
//!
//! Two wire formats are supported behind the [FrameCodec] trait:
//!
//! - [StuffedCodec]: delimiter framed and byte stuffed, protected by a CRC32
//! - [Esp3Codec]: length prefixed after the ESP3 layout, protected by two CRC8s
//!
//! A link uses exactly one of them for its whole lifetime, together with one
//! [DecoderState] that carries partial frames across calls to
//! [FrameCodec::decode].

use embedded_io::Write;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};
use thiserror::Error;

pub use self::{esp3::Esp3Codec, stuffed::StuffedCodec};
use crate::frame::{Frame, FrameFlags, FRAME_MAX_SIZE};

mod esp3;
mod stuffed;

/// Operations shared by both wire formats
pub trait FrameCodec {
    /// Serialize a frame into `writer`, returning the number of bytes written.
    fn encode<W: Write>(&self, frame: &Frame, writer: &mut W) -> Result<usize, EncodeError>;

    /// Number of bytes [FrameCodec::encode] will produce for `frame`.
    fn encoded_len(&self, frame: &Frame) -> Result<usize, EncodeError>;

    /// Feed bytes to the decoder.
    ///
    /// Returns how many bytes of `input` were absorbed along with the result.
    /// Decoding stops right after the byte which completes a frame, so the
    /// caller can decode the remainder of the same buffer with another call.
    fn decode(&self, input: &[u8], state: &mut DecoderState)
        -> (usize, Result<Frame, DecodeOutcome>);

    /// Drop any partially decoded frame.
    fn reset(&self, state: &mut DecoderState) {
        state.reset();
    }

    /// Encode into a freshly allocated buffer of the exact size.
    fn encode_to_vec(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.encoded_len(frame)?)
            .map_err(|_| EncodeError::OutOfMemory)?;
        self.encode(frame, &mut buf)?;

        Ok(buf)
    }

    /// Decode every complete frame in `input`.
    ///
    /// A trailing partial frame stays buffered in `state`.
    fn decode_all(
        &self,
        mut input: &[u8],
        state: &mut DecoderState,
    ) -> Vec<Result<Frame, DecodeOutcome>> {
        let mut results = Vec::new();

        while !input.is_empty() {
            let (consumed, result) = self.decode(input, state);
            input = &input[consumed..];

            match result {
                Err(outcome) if outcome.is_pending() => break,
                result => results.push(result),
            }
        }

        results
    }
}

/// Failure to serialize a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Diagnostic, Error)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("Output rejected the encoded frame ({0:?})")]
    #[diagnostic(
        code(mkiilink::encode::write),
        help("The output buffer is probably too small, see `FrameCodec::encoded_len`")
    )]
    Write(embedded_io::ErrorKind),

    #[error("Frame type {0} does not fit the wire format")]
    #[diagnostic(code(mkiilink::encode::type_out_of_range))]
    TypeOutOfRange(u32),

    #[error("Payload of {0} bytes does not fit the wire format")]
    #[diagnostic(code(mkiilink::encode::payload_too_large))]
    PayloadTooLarge(usize),

    #[error("Out of memory while encoding a frame")]
    #[diagnostic(code(mkiilink::encode::out_of_memory))]
    OutOfMemory,
}

pub(crate) fn write_error<E: embedded_io::Error>(err: E) -> EncodeError {
    EncodeError::Write(err.kind())
}

/// Anything other than a clean frame coming out of the decoder
#[derive(Clone, Debug, PartialEq, Eq, Diagnostic, Error)]
#[non_exhaustive]
pub enum DecodeOutcome {
    #[error("No frame delimiter found")]
    #[diagnostic(code(mkiilink::decode::no_frame))]
    NoFrame,

    #[error("Frame incomplete, more input needed")]
    #[diagnostic(code(mkiilink::decode::partial))]
    Partial,

    #[error("Frame failed its integrity check")]
    #[diagnostic(
        code(mkiilink::decode::crc),
        help("The frame is still attached and can be inspected, but should not be trusted")
    )]
    CrcMismatch(Box<Frame>),

    #[error("Malformed frame of {len} bytes")]
    #[diagnostic(code(mkiilink::decode::malformed))]
    Malformed { len: usize },

    #[error("Frame exceeds the {capacity} byte decode buffer")]
    #[diagnostic(
        code(mkiilink::decode::too_big),
        help("Raise the decoder capacity if frames of this size are legitimate")
    )]
    TooBig { capacity: usize },

    #[error("Unknown destination {0:#04x}")]
    #[diagnostic(code(mkiilink::decode::unknown_destination))]
    UnknownDestination(u8),

    #[error("Out of memory while decoding a frame")]
    #[diagnostic(code(mkiilink::decode::out_of_memory))]
    OutOfMemory,
}

impl DecodeOutcome {
    /// Whether the decoder simply needs more input
    pub fn is_pending(&self) -> bool {
        matches!(self, DecodeOutcome::NoFrame | DecodeOutcome::Partial)
    }

    pub fn flags(&self) -> FrameFlags {
        match self {
            DecodeOutcome::Partial => FrameFlags::PARTIAL,
            DecodeOutcome::CrcMismatch(frame) => frame.flags,
            _ => FrameFlags::empty(),
        }
    }
}

/// Where the decoder is within a frame
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Looking for the start of a frame
    #[default]
    Searching,
    Accumulating,
    /// Previous byte was an escape
    Escape,
    /// Length-prefixed header checked, collecting the body
    HeaderVerified,
    /// A frame was just emitted
    Done,
}

/// Per-link decoder state
#[derive(Debug)]
pub struct DecoderState {
    buf: Vec<u8>,
    capacity: usize,
    phase: Phase,
    /// Body bytes expected after a verified header
    expected: usize,
}

impl DecoderState {
    /// Create a decoder state which accumulates at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        DecoderState {
            buf: Vec::new(),
            capacity,
            phase: Phase::Searching,
            expected: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.phase = Phase::Searching;
        self.expected = 0;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of the current frame accumulated so far
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, byte: u8) -> Result<(), DecodeOutcome> {
        if self.buf.len() >= self.capacity {
            return Err(DecodeOutcome::TooBig {
                capacity: self.capacity,
            });
        }

        if self.buf.len() == self.buf.capacity() {
            let additional = self
                .buf
                .capacity()
                .max(64)
                .min(self.capacity - self.buf.len());
            self.buf
                .try_reserve(additional)
                .map_err(|_| DecodeOutcome::OutOfMemory)?;
        }

        self.buf.push(byte);
        Ok(())
    }

    /// Hand the accumulated bytes to the caller, leaving the state `Done`.
    fn take(&mut self) -> Vec<u8> {
        self.phase = Phase::Done;
        self.expected = 0;
        std::mem::take(&mut self.buf)
    }
}

impl Default for DecoderState {
    fn default() -> Self {
        Self::new(FRAME_MAX_SIZE)
    }
}

/// Wire formats available for a link
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// Byte-stuffed frames with a CRC32
    #[default]
    Stuffed,
    /// ESP3-style length-prefixed frames with CRC8s
    Esp3,
}

/// A codec chosen at configuration time
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    Stuffed(StuffedCodec),
    Esp3(Esp3Codec),
}

impl Codec {
    pub fn format(&self) -> WireFormat {
        match self {
            Codec::Stuffed(_) => WireFormat::Stuffed,
            Codec::Esp3(_) => WireFormat::Esp3,
        }
    }
}

impl From<WireFormat> for Codec {
    fn from(format: WireFormat) -> Self {
        match format {
            WireFormat::Stuffed => Codec::Stuffed(StuffedCodec),
            WireFormat::Esp3 => Codec::Esp3(Esp3Codec),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        WireFormat::default().into()
    }
}

impl FrameCodec for Codec {
    fn encode<W: Write>(&self, frame: &Frame, writer: &mut W) -> Result<usize, EncodeError> {
        match self {
            Codec::Stuffed(codec) => codec.encode(frame, writer),
            Codec::Esp3(codec) => codec.encode(frame, writer),
        }
    }

    fn encoded_len(&self, frame: &Frame) -> Result<usize, EncodeError> {
        match self {
            Codec::Stuffed(codec) => codec.encoded_len(frame),
            Codec::Esp3(codec) => codec.encoded_len(frame),
        }
    }

    fn decode(
        &self,
        input: &[u8],
        state: &mut DecoderState,
    ) -> (usize, Result<Frame, DecodeOutcome>) {
        match self {
            Codec::Stuffed(codec) => codec.decode(input, state),
            Codec::Esp3(codec) => codec.decode(input, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::{Destination, FrameType};

    #[test]
    fn wire_format_selects_codec() {
        assert_eq!(Codec::from(WireFormat::Esp3).format(), WireFormat::Esp3);
        assert_eq!(Codec::default().format(), WireFormat::Stuffed);
        assert_eq!("esp3".parse::<WireFormat>().ok(), Some(WireFormat::Esp3));
    }

    #[test]
    fn decode_all_recovers_back_to_back_frames() {
        for format in [WireFormat::Stuffed, WireFormat::Esp3] {
            let codec = Codec::from(format);
            let a = Frame::new(Destination::Base, FrameType::DebugString, &b"first"[..]);
            let b = Frame::new(Destination::Base, FrameType::DataString, &b"second"[..]);

            let mut stream = codec.encode_to_vec(&a).unwrap();
            stream.extend(codec.encode_to_vec(&b).unwrap());
            // start of a third frame, left pending
            stream.extend(&codec.encode_to_vec(&a).unwrap()[..4]);

            let mut state = DecoderState::default();
            let frames = codec
                .decode_all(&stream, &mut state)
                .into_iter()
                .map(|res| res.unwrap().payload)
                .collect::<Vec<_>>();

            assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
            assert_ne!(state.phase(), Phase::Searching);
        }
    }

    #[test]
    fn decoder_push_fails_closed_at_capacity() {
        let mut state = DecoderState::new(2);
        assert!(state.push(1).is_ok());
        assert!(state.push(2).is_ok());
        assert_eq!(state.push(3), Err(DecodeOutcome::TooBig { capacity: 2 }));
        assert_eq!(state.buffered(), 2);
    }
}
