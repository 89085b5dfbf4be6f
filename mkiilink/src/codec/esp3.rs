//! Length-prefixed frames after the EnOcean ESP3 layout
//!
//! ```text
//! 55 | LEN u16 BE | OPTLEN | TYPE u8 | CRC8H | DATA | DEST | CRC8D
//! ```
//!
//! There is no escaping. The header CRC covers the four bytes between the
//! sync byte and itself, the data CRC covers the data and the destination,
//! which travels as the single byte of "optional data".

use crc::{Crc, CRC_8_SMBUS};
use embedded_io::Write;

use super::{write_error, DecodeOutcome, DecoderState, EncodeError, FrameCodec, Phase};
use crate::frame::{Destination, Frame, FrameFlags, FrameType};

const SYNC: u8 = 0x55;

/// Length, optional length and type
const HEADER_LEN: usize = 4;

/// Header plus its CRC
const HEADER_WITH_CRC: usize = HEADER_LEN + 1;

/// The destination byte
const OPT_LEN: u8 = 1;

/// Sync, header, header CRC, destination and data CRC
const OVERHEAD: usize = 1 + HEADER_WITH_CRC + OPT_LEN as usize + 1;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// The length-prefixed CRC8 wire format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Esp3Codec;

enum Header {
    Valid { body: usize },
    /// Failed its CRC, most likely a sync byte inside other data
    Noise,
    Rejected(DecodeOutcome),
}

impl Esp3Codec {
    fn header(&self, frame: &Frame) -> Result<[u8; HEADER_LEN], EncodeError> {
        let len = u16::try_from(frame.payload.len())
            .map_err(|_| EncodeError::PayloadTooLarge(frame.payload.len()))?;
        let ty = u8::try_from(frame.frame_type.as_u32())
            .map_err(|_| EncodeError::TypeOutOfRange(frame.frame_type.as_u32()))?;
        let [len_hi, len_lo] = len.to_be_bytes();

        Ok([len_hi, len_lo, OPT_LEN, ty])
    }

    fn check_header(&self, state: &DecoderState) -> Header {
        let header = &state.buf[..HEADER_LEN];
        if CRC8.checksum(header) != state.buf[HEADER_LEN] {
            return Header::Noise;
        }

        if header[2] != OPT_LEN {
            return Header::Rejected(DecodeOutcome::Malformed {
                len: HEADER_WITH_CRC,
            });
        }

        let data_len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let body = data_len + OPT_LEN as usize + 1;
        if HEADER_WITH_CRC + body > state.capacity {
            return Header::Rejected(DecodeOutcome::TooBig {
                capacity: state.capacity,
            });
        }

        Header::Valid { body }
    }

    /// Look for another sync byte among the header bytes already consumed.
    fn resync(&self, state: &mut DecoderState) {
        match state.buf.iter().position(|b| *b == SYNC) {
            Some(pos) => {
                state.buf.drain(..=pos);
                state.phase = Phase::Accumulating;
            }
            None => state.reset(),
        }
    }

    fn finish(&self, state: &mut DecoderState) -> Result<Frame, DecodeOutcome> {
        let mut buf = state.take();
        let len = buf.len();

        let dest = buf[len - 2];
        let crc = buf[len - 1];
        let valid = CRC8.checksum(&buf[HEADER_WITH_CRC..len - 1]) == crc;
        let destination = Destination::from_repr(dest).ok_or(DecodeOutcome::UnknownDestination(dest))?;
        let frame_type = FrameType::from(u32::from(buf[3]));

        buf.truncate(len - 2);
        buf.drain(..HEADER_WITH_CRC);

        let mut flags = FrameFlags::FRAME_FOUND;
        if buf.is_empty() {
            flags |= FrameFlags::NO_PAYLOAD;
        }
        if !valid {
            flags |= FrameFlags::CRC_ERROR;
        }

        let frame = Frame {
            destination,
            frame_type,
            payload: buf,
            timestamp_us: 0,
            crc: u32::from(crc),
            flags,
        };

        if valid {
            Ok(frame)
        } else {
            Err(DecodeOutcome::CrcMismatch(Box::new(frame)))
        }
    }
}

impl FrameCodec for Esp3Codec {
    fn encode<W: Write>(&self, frame: &Frame, writer: &mut W) -> Result<usize, EncodeError> {
        let header = self.header(frame)?;
        let dest = frame.destination.as_u8();

        let mut digest = CRC8.digest();
        digest.update(&frame.payload);
        digest.update(&[dest]);
        let data_crc = digest.finalize();

        writer.write_all(&[SYNC]).map_err(write_error)?;
        writer.write_all(&header).map_err(write_error)?;
        writer
            .write_all(&[CRC8.checksum(&header)])
            .map_err(write_error)?;
        writer.write_all(&frame.payload).map_err(write_error)?;
        writer.write_all(&[dest, data_crc]).map_err(write_error)?;

        Ok(frame.payload.len() + OVERHEAD)
    }

    fn encoded_len(&self, frame: &Frame) -> Result<usize, EncodeError> {
        self.header(frame)?;
        Ok(frame.payload.len() + OVERHEAD)
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
                Phase::Accumulating => {
                    if let Err(outcome) = state.push(value) {
                        state.reset();
                        return (consumed, Err(outcome));
                    }

                    if state.buf.len() == HEADER_WITH_CRC {
                        match self.check_header(state) {
                            Header::Valid { body } => {
                                state.expected = body;
                                state.phase = Phase::HeaderVerified;
                            }
                            Header::Noise => self.resync(state),
                            Header::Rejected(outcome) => {
                                state.reset();
                                return (consumed, Err(outcome));
                            }
                        }
                    }
                }
                Phase::HeaderVerified => {
                    if let Err(outcome) = state.push(value) {
                        state.reset();
                        return (consumed, Err(outcome));
                    }

                    if state.buf.len() == HEADER_WITH_CRC + state.expected {
                        return (consumed, self.finish(state));
                    }
                }
                Phase::Searching | Phase::Escape | Phase::Done => {
                    if value == SYNC {
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
