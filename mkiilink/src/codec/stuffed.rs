//! Byte-stuffed frames delimited by `0x7E`
//!
//! ```text
//! 7E | DEST u8 | TYPE u32 LE | PAYLOAD | CRC32 LE | TIMESTAMP u64 LE | 7E
//! ```
//!
//! Everything between the delimiters is escaped: a literal `0x7E` or `0x7D`
//! is sent as `0x7D` followed by the byte with bit 5 toggled. The CRC covers
//! the unescaped payload only.

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_io::Write;

use super::{write_error, DecodeOutcome, DecoderState, EncodeError, FrameCodec, Phase};
use crate::frame::{Destination, Frame, FrameFlags, FrameType};

/// Frame delimiter
const FLAG: u8 = 0x7E;

/// Escape token
const ESC: u8 = 0x7D;

/// Mask applied to an escaped byte
const ESC_XOR: u8 = 0x20;

/// Unescaped bytes around the payload: destination, type, CRC and timestamp
pub(crate) const METADATA_LEN: usize = 1 + 4 + 4 + 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Writes the escaped body of a frame between two delimiters
#[derive(Debug)]
pub struct StuffingEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> StuffingEncoder<'a, W> {
    /// Creates a new encoder context, emitting the opening delimiter
    pub fn new(writer: &'a mut W) -> Result<Self, W::Error> {
        writer.write_all(&[FLAG])?;
        Ok(Self { writer, len: 1 })
    }

    /// Emit the closing delimiter and return the number of bytes written
    pub fn finish(self) -> Result<usize, W::Error> {
        self.writer.write_all(&[FLAG])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> embedded_io::ErrorType for StuffingEncoder<'_, W> {
    type Error = W::Error;
}

impl<W: Write> Write for StuffingEncoder<'_, W> {
    /// Writes the given buffer escaping FLAG and ESC bytes
    fn write(&mut self, buf: &[u8]) -> Result<usize, W::Error> {
        for value in buf.iter() {
            match *value {
                FLAG | ESC => {
                    self.writer.write_all(&[ESC, *value ^ ESC_XOR])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), W::Error> {
        self.writer.flush()
    }
}

fn stuffed_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .map(|b| if matches!(*b, FLAG | ESC) { 2 } else { 1 })
        .sum()
}

/// The byte-stuffed CRC32 wire format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StuffedCodec;

impl StuffedCodec {
    fn finish(&self, state: &mut DecoderState) -> Result<Frame, DecodeOutcome> {
        let len = state.buf.len();
        if len < METADATA_LEN {
            state.reset();
            return Err(DecodeOutcome::Malformed { len });
        }

        let mut buf = state.take();

        let destination =
            Destination::from_repr(buf[0]).ok_or(DecodeOutcome::UnknownDestination(buf[0]))?;
        let frame_type = FrameType::from(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]));

        let crc_at = len - 12;
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[crc_at..crc_at + 4]);
        let crc = u32::from_le_bytes(crc);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[len - 8..]);

        buf.truncate(crc_at);
        buf.drain(..5);

        let mut flags = FrameFlags::FRAME_FOUND;
        if buf.is_empty() {
            flags |= FrameFlags::NO_PAYLOAD;
        }

        let valid = CRC32.checksum(&buf) == crc;
        if !valid {
            flags |= FrameFlags::CRC_ERROR;
        }

        let frame = Frame {
            destination,
            frame_type,
            payload: buf,
            timestamp_us: u64::from_le_bytes(timestamp),
            crc,
            flags,
        };

        if valid {
            Ok(frame)
        } else {
            Err(DecodeOutcome::CrcMismatch(Box::new(frame)))
        }
    }
}

impl FrameCodec for StuffedCodec {
    fn encode<W: Write>(&self, frame: &Frame, writer: &mut W) -> Result<usize, EncodeError> {
        let crc = CRC32.checksum(&frame.payload);

        let mut encoder = StuffingEncoder::new(writer).map_err(write_error)?;
        encoder
            .write_all(&[frame.destination.as_u8()])
            .map_err(write_error)?;
        encoder
            .write_all(&frame.frame_type.as_u32().to_le_bytes())
            .map_err(write_error)?;
        encoder.write_all(&frame.payload).map_err(write_error)?;
        encoder.write_all(&crc.to_le_bytes()).map_err(write_error)?;
        encoder
            .write_all(&frame.timestamp_us.to_le_bytes())
            .map_err(write_error)?;

        encoder.finish().map_err(write_error)
    }

    fn encoded_len(&self, frame: &Frame) -> Result<usize, EncodeError> {
        let crc = CRC32.checksum(&frame.payload);

        Ok(2 + stuffed_len(&[frame.destination.as_u8()])
            + stuffed_len(&frame.frame_type.as_u32().to_le_bytes())
            + stuffed_len(&frame.payload)
            + stuffed_len(&crc.to_le_bytes())
            + stuffed_len(&frame.timestamp_us.to_le_bytes()))
    }

    fn decode(
        &self,
        input: &[u8],
        state: &mut DecoderState,
    ) -> (usize, Result<Frame, DecodeOutcome>) {
        if state.phase == Phase::Done {
            state.reset();
        }

        for (index, value) in input.iter().copied().enumerate() {
            let consumed = index + 1;

            match state.phase {
                Phase::Accumulating => match value {
                    // Back-to-back delimiters are line noise, not an empty frame
                    FLAG if state.buf.is_empty() => {}
                    FLAG => return (consumed, self.finish(state)),
                    ESC => state.phase = Phase::Escape,
                    _ => {
                        if let Err(outcome) = state.push(value) {
                            state.reset();
                            return (consumed, Err(outcome));
                        }
                    }
                },
                Phase::Escape => {
                    state.phase = Phase::Accumulating;

                    if value == FLAG {
                        // Sender aborted the frame
                        state.buf.clear();
                    } else if let Err(outcome) = state.push(value ^ ESC_XOR) {
                        state.reset();
                        return (consumed, Err(outcome));
                    }
                }
                Phase::Searching | Phase::HeaderVerified | Phase::Done => {
                    if value == FLAG {
                        state.buf.clear();
                        state.phase = Phase::Accumulating;
                    }
                }
            }
        }

        let outcome = if state.phase == Phase::Searching {
            DecodeOutcome::NoFrame
        } else {
            DecodeOutcome::Partial
        };

        (input.len(), Err(outcome))
    }
}
