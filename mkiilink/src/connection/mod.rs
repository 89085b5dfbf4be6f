//! Framed connection with a node
//!
//! The [Connection] struct abstracts over the byte stream, which is normally a
//! serial port but can be anything implementing [Port], and over the wire
//! format spoken on it.

use std::{
    io::{Read, Write},
    time::Duration,
};

use log::{debug, warn};

use crate::{
    codec::{Codec, DecodeOutcome, DecoderState, FrameCodec},
    error::{Error, TimedOutCommand},
    frame::{Frame, HOST_FRAME_MAX_SIZE},
};

/// Bytes requested from the port per read
const READ_CHUNK_SIZE: usize = 4096;

/// A byte stream with an adjustable read timeout
pub trait Port: Read + Write {
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        (**self).set_timeout(timeout)
    }
}

/// An established connection with a node
pub struct Connection<P> {
    port: P,
    codec: Codec,
    state: DecoderState,
    rx: Vec<u8>,
    rx_pos: usize,
}

impl<P: Port> Connection<P> {
    pub fn new(port: P, codec: Codec) -> Self {
        Self::with_capacity(port, codec, HOST_FRAME_MAX_SIZE)
    }

    /// Create a connection whose decoder buffers at most `capacity` bytes.
    pub fn with_capacity(port: P, codec: Codec, capacity: usize) -> Self {
        Connection {
            port,
            codec,
            state: DecoderState::new(capacity),
            rx: Vec::new(),
            rx_pos: 0,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Set timeout for the port
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)
    }

    /// Run an operation with a temporary read timeout
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection<P>) -> Result<T, Error>,
    {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;

        let result = f(self);

        self.port.set_timeout(old_timeout)?;

        result
    }

    /// Encode a frame and write it to the port
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        debug!(
            "Writing {} frame to {} ({} bytes of payload)",
            frame.frame_type,
            frame.destination,
            frame.payload.len()
        );

        let bytes = self.codec.encode_to_vec(frame)?;
        self.port.write_all(&bytes)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read the next frame which passes its integrity check
    ///
    /// Bytes following the frame stay buffered for the next call.
    pub fn read_frame(&mut self) -> Result<Frame, Error> {
        loop {
            if self.rx_pos >= self.rx.len() {
                self.fill()?;
                continue;
            }

            let (consumed, result) = self
                .codec
                .decode(&self.rx[self.rx_pos..], &mut self.state);
            self.rx_pos += consumed;

            match result {
                Ok(frame) => {
                    debug!(
                        "Read {} frame for {} ({} bytes)",
                        frame.frame_type,
                        frame.destination,
                        frame.payload.len()
                    );
                    return Ok(frame);
                }
                Err(outcome) if outcome.is_pending() => {}
                Err(DecodeOutcome::CrcMismatch(frame)) => {
                    warn!(
                        "Skipping {} frame with bad CRC {:#010x}",
                        frame.frame_type, frame.crc
                    );
                }
                Err(outcome) => warn!("{outcome}, resyncing"),
            }
        }
    }

    /// Drop buffered input and any partially decoded frame.
    pub fn discard_input(&mut self) {
        self.rx.clear();
        self.rx_pos = 0;
        self.codec.reset(&mut self.state);
    }

    fn fill(&mut self) -> Result<(), Error> {
        self.rx.resize(READ_CHUNK_SIZE, 0);
        self.rx_pos = 0;

        let read = self.port.read(&mut self.rx);
        let len = match read {
            Ok(len) => len,
            Err(err) => {
                self.rx.clear();
                return Err(err.into());
            }
        };

        self.rx.truncate(len);
        if len == 0 {
            return Err(Error::Timeout(TimedOutCommand::default()));
        }

        Ok(())
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Turn the connection back into its port
    pub fn into_port(self) -> P {
        self.port
    }
}
