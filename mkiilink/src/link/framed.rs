use log::{debug, warn};

use crate::{
    codec::{DecodeOutcome, DecoderState, FrameCodec},
    error::{Error, LinkError},
    frame::Frame,
    router::FrameSink,
};

/// A transport moving opaque byte buffers
pub trait ByteLink {
    type Buffer: AsRef<[u8]>;

    /// Send `bytes`, returning anything received during the exchange.
    fn send(&mut self, bytes: &[u8]) -> Result<Option<Self::Buffer>, LinkError>;

    /// Capture one inbound transfer.
    fn receive(&mut self) -> Result<Option<Self::Buffer>, LinkError>;

    fn peer_requesting(&self) -> bool;
}

/// A byte link speaking one wire format
#[derive(Debug)]
pub struct FramedLink<K, T> {
    codec: K,
    link: T,
    state: DecoderState,
}

impl<K, T> FramedLink<K, T>
where
    K: FrameCodec,
    T: ByteLink,
{
    pub fn new(codec: K, link: T, capacity: usize) -> Self {
        FramedLink {
            codec,
            link,
            state: DecoderState::new(capacity),
        }
    }

    pub fn codec(&self) -> &K {
        &self.codec
    }

    pub fn link_mut(&mut self) -> &mut T {
        &mut self.link
    }

    /// Encode and send a frame, returning any frames the peer sent back.
    pub fn exchange(&mut self, frame: &Frame) -> Result<Vec<Frame>, Error> {
        let bytes = self.codec.encode_to_vec(frame)?;
        debug!(
            "Sending {} frame to {} ({} bytes)",
            frame.frame_type,
            frame.destination,
            bytes.len()
        );

        let reply = self.link.send(&bytes)?;
        Ok(self.decode(reply))
    }

    /// Capture an inbound transfer if the peer is asking to send.
    pub fn poll_receive(&mut self) -> Result<Vec<Frame>, Error> {
        if !self.link.peer_requesting() {
            return Ok(Vec::new());
        }

        let captured = self.link.receive()?;
        Ok(self.decode(captured))
    }

    /// Decode one captured buffer, which may hold several frames.
    fn decode(&mut self, captured: Option<T::Buffer>) -> Vec<Frame> {
        let Some(captured) = captured else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        for result in self.codec.decode_all(captured.as_ref(), &mut self.state) {
            match result {
                Ok(frame) => frames.push(frame),
                Err(DecodeOutcome::CrcMismatch(frame)) => frames.push(*frame),
                Err(outcome) => warn!("Discarding bytes: {outcome}"),
            }
        }

        // a frame cut short by the end of the transfer never continues into the next one
        if self.state.buffered() > 0 {
            warn!("Transfer ended inside a frame, {} bytes dropped", self.state.buffered());
        }
        self.codec.reset(&mut self.state);

        frames
    }
}

impl<K, T> FrameSink for FramedLink<K, T>
where
    K: FrameCodec,
    T: ByteLink,
{
    fn send_frame(&mut self, frame: &Frame) -> Result<Vec<Frame>, Error> {
        self.exchange(frame)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        codec::{Codec, WireFormat},
        frame::{Destination, FrameFlags, FrameType, FRAME_MAX_SIZE},
    };

    /// Answers every send with a canned reply
    #[derive(Default)]
    struct Scripted {
        sent: Vec<Vec<u8>>,
        reply: Option<Vec<u8>>,
        inbound: Option<Vec<u8>>,
    }

    impl ByteLink for Scripted {
        type Buffer = Vec<u8>;

        fn send(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, LinkError> {
            self.sent.push(bytes.to_vec());
            Ok(self.reply.take())
        }

        fn receive(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
            Ok(self.inbound.take())
        }

        fn peer_requesting(&self) -> bool {
            self.inbound.is_some()
        }
    }

    #[test]
    fn exchange_decodes_back_to_back_replies() {
        let codec = Codec::from(WireFormat::Esp3);
        let debug = Frame::new(Destination::Base, FrameType::DebugStringBms, &b"ok"[..]);
        let ack = Frame::empty(Destination::Base, FrameType::Ack);

        let mut reply = codec.encode_to_vec(&debug).unwrap();
        reply.extend(codec.encode_to_vec(&ack).unwrap());

        let link = Scripted {
            reply: Some(reply),
            ..Default::default()
        };
        let mut framed = FramedLink::new(codec, link, FRAME_MAX_SIZE);

        let hello = Frame::empty(Destination::BatteryManagementSystem, FrameType::Hello);
        let frames = framed.exchange(&hello).unwrap();

        assert_eq!(
            frames.iter().map(|f| f.frame_type).collect::<Vec<_>>(),
            vec![FrameType::DebugStringBms, FrameType::Ack]
        );
        assert_eq!(framed.link_mut().sent.len(), 1);
    }

    #[test]
    fn partial_frame_is_not_carried_over() {
        let codec = Codec::from(WireFormat::Stuffed);
        let frame = Frame::new(Destination::Base, FrameType::DataString, &b"{}"[..]);
        let bytes = codec.encode_to_vec(&frame).unwrap();

        let link = Scripted {
            inbound: Some(bytes[..bytes.len() - 1].to_vec()),
            ..Default::default()
        };
        let mut framed = FramedLink::new(codec, link, FRAME_MAX_SIZE);

        assert!(framed.poll_receive().unwrap().is_empty());

        // the closing delimiter alone must not complete the earlier frame
        framed.link_mut().inbound = Some(bytes[bytes.len() - 1..].to_vec());
        assert!(framed.poll_receive().unwrap().is_empty());
    }

    #[test]
    fn corrupt_frames_are_passed_up_flagged() {
        let codec = Codec::from(WireFormat::Stuffed);
        let frame = Frame::new(Destination::Base, FrameType::DataString, &b"{}"[..]);
        let mut bytes = codec.encode_to_vec(&frame).unwrap();
        bytes[6] ^= 0x01;

        let link = Scripted {
            inbound: Some(bytes),
            ..Default::default()
        };
        let mut framed = FramedLink::new(codec, link, FRAME_MAX_SIZE);
        let frames = framed.poll_receive().unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].flags.contains(FrameFlags::CRC_ERROR));
    }
}
