//! Half-duplex UART transport with RTS/CTS style handshaking
//!
//! Each side owns one output line (request when sending, ready when
//! receiving) and watches the peer's. A sender raises its line, waits for the
//! peer to answer, transmits, drops its line and waits for the peer to drop
//! its own. Bytes the peer sends in the meantime are captured by the receive
//! interrupt into an [RxPipe] and handed up once the exchange is over.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use embedded_io::{Error as _, Write};
use heapless::Vec as HVec;
use log::{debug, warn};

pub use self::{
    framed::{ByteLink, FramedLink},
    rx::RxPipe,
};
use crate::error::LinkError;

mod framed;
mod rx;

/// Receive capacity agreed upon by both ends of an inter-MCU link
pub const LINK_BUFFER_SIZE: usize = 1024;

/// The pair of handshake GPIOs
///
/// Shared with the receive interrupt, which drops the local line when an
/// inbound frame starts.
pub trait HandshakeLines: Sync {
    /// Drive our request/ready output.
    fn set_local(&self, asserted: bool);

    /// Level of the peer's output as seen on our input.
    fn peer(&self) -> bool;
}

/// Millisecond time base
pub trait Clock {
    fn now_ms(&self) -> u32;

    fn delay_ms(&mut self, ms: u32);

    /// Sleep until the next interrupt.
    fn wait_for_interrupt(&mut self) {
        self.delay_ms(1);
    }
}

/// Handshake wait limits, in milliseconds
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    /// Peer answering our request
    pub grant_ms: u32,
    /// Peer letting go after we finished sending
    pub release_ms: u32,
    /// Peer finishing an inbound transfer
    pub receive_ms: u32,
    /// Anti-glitch re-check of the peer's request
    pub settle_ms: u32,
}

impl HandshakeTimeouts {
    pub const fn application_processor() -> Self {
        HandshakeTimeouts {
            grant_ms: 20,
            release_ms: 1000,
            receive_ms: 1000,
            settle_ms: 1,
        }
    }

    pub const fn battery_management_system() -> Self {
        HandshakeTimeouts {
            grant_ms: 10,
            release_ms: 100,
            receive_ms: 100,
            settle_ms: 1,
        }
    }
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self::application_processor()
    }
}

/// Process-wide cancellation flag, polled by every wait loop
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One end of a flow-controlled UART link
pub struct Transport<'a, U, L, C, const N: usize>
where
    L: HandshakeLines,
{
    uart: U,
    lines: &'a L,
    clock: C,
    rx: &'a RxPipe<N>,
    timeouts: HandshakeTimeouts,
    abort: AbortSignal,
}

impl<'a, U, L, C, const N: usize> Transport<'a, U, L, C, N>
where
    U: Write,
    L: HandshakeLines,
    C: Clock,
{
    pub fn new(
        uart: U,
        lines: &'a L,
        clock: C,
        rx: &'a RxPipe<N>,
        timeouts: HandshakeTimeouts,
        abort: AbortSignal,
    ) -> Self {
        Transport {
            uart,
            lines,
            clock,
            rx,
            timeouts,
            abort,
        }
    }

    pub fn timeouts(&self) -> HandshakeTimeouts {
        self.timeouts
    }

    /// Whether the peer is asking to send
    pub fn peer_requesting(&self) -> bool {
        self.lines.peer()
    }

    /// Send `bytes`, returning whatever the peer sent back meanwhile.
    pub fn send(&mut self, bytes: &[u8]) -> Result<Option<HVec<u8, N>>, LinkError> {
        self.rx.set_transmitting(true);
        // replies may start before our own transmission ends
        self.rx.enable();
        self.lines.set_local(true);

        match self.wait_peer(true, self.timeouts.grant_ms) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Peer did not grant the channel, nothing sent");
                self.finish();
                return Err(LinkError::GrantTimeout(self.timeouts.grant_ms));
            }
            Err(err) => {
                self.finish();
                return Err(err);
            }
        }

        let sent = self
            .uart
            .write_all(bytes)
            .and_then(|_| self.uart.flush())
            .map_err(|err| LinkError::Uart(err.kind()));
        if let Err(err) = sent {
            self.finish();
            return Err(err);
        }

        self.rx.set_transmitting(false);
        self.lines.set_local(false);

        match self.wait_peer(false, self.timeouts.release_ms) {
            Ok(true) => {}
            Ok(false) => {
                self.rx.abort();
                self.finish();
                return Err(LinkError::ReleaseTimeout(self.timeouts.release_ms));
            }
            Err(err) => {
                self.finish();
                return Err(err);
            }
        }

        self.settle_last_byte();
        self.rx.disable();

        let aborted = self.rx.is_aborted();
        let reply = self.rx.take();
        debug!("Sent {} bytes, {} bytes back", bytes.len(), reply.len());

        Ok((!reply.is_empty() && !aborted).then_some(reply))
    }

    /// Capture an inbound transfer. Call once the peer's request is seen.
    pub fn receive(&mut self) -> Result<Option<HVec<u8, N>>, LinkError> {
        self.rx.set_transmitting(false);
        self.rx.enable();

        match self.wait_peer(true, self.timeouts.settle_ms) {
            Ok(true) => {}
            Ok(false) => {
                self.finish();
                return Err(LinkError::Glitch);
            }
            Err(err) => {
                self.finish();
                return Err(err);
            }
        }

        self.lines.set_local(true);

        let start = self.clock.now_ms();
        while self.lines.peer() {
            if self.abort.is_aborted() {
                self.finish();
                return Err(LinkError::Aborted);
            }

            if self.rx.is_aborted() {
                warn!("Receive overrun, discarding transfer");
                self.finish();
                return Err(LinkError::Overrun);
            }

            if self.clock.now_ms().wrapping_sub(start) >= self.timeouts.receive_ms {
                self.finish();
                return Err(LinkError::ReceiveTimeout(self.timeouts.receive_ms));
            }

            self.clock.wait_for_interrupt();
        }

        self.lines.set_local(false);
        self.settle_last_byte();
        self.rx.disable();

        let aborted = self.rx.is_aborted();
        let captured = self.rx.take();
        if aborted {
            warn!("Receive overrun, discarding transfer");
            return Err(LinkError::Overrun);
        }

        debug!("Received {} bytes", captured.len());
        Ok((!captured.is_empty()).then_some(captured))
    }

    /// Poll the peer's line until it reads `level`, returning false on timeout.
    ///
    /// Gives up early when the host aborts or the receive buffer overruns.
    fn wait_peer(&mut self, level: bool, timeout_ms: u32) -> Result<bool, LinkError> {
        let start = self.clock.now_ms();
        loop {
            if self.lines.peer() == level {
                return Ok(true);
            }
            if self.abort.is_aborted() {
                return Err(LinkError::Aborted);
            }
            if self.rx.is_aborted() {
                warn!("Receive overrun, abandoning exchange");
                return Err(LinkError::Overrun);
            }
            if self.clock.now_ms().wrapping_sub(start) >= timeout_ms {
                return Ok(false);
            }

            self.clock.delay_ms(1);
        }
    }

    /// Leave the interrupt unmasked one more tick for a byte still in the
    /// UART shift register when the peer let go.
    fn settle_last_byte(&mut self) {
        if !self.rx.is_aborted() {
            self.clock.delay_ms(1);
        }
    }

    /// Return to idle: lines released, interrupt masked, buffer dropped.
    fn finish(&mut self) {
        self.lines.set_local(false);
        self.rx.set_transmitting(false);
        self.rx.disable();
        self.rx.take();
    }
}

impl<U, L, C, const N: usize> ByteLink for Transport<'_, U, L, C, N>
where
    U: Write,
    L: HandshakeLines,
    C: Clock,
{
    type Buffer = HVec<u8, N>;

    fn send(&mut self, bytes: &[u8]) -> Result<Option<Self::Buffer>, LinkError> {
        Transport::send(self, bytes)
    }

    fn receive(&mut self) -> Result<Option<Self::Buffer>, LinkError> {
        Transport::receive(self)
    }

    fn peer_requesting(&self) -> bool {
        Transport::peer_requesting(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct Lines {
        local: AtomicBool,
        peer: AtomicBool,
    }

    impl Lines {
        pub(crate) fn local(&self) -> bool {
            self.local.load(Ordering::SeqCst)
        }

        pub(crate) fn set_peer(&self, level: bool) {
            self.peer.store(level, Ordering::SeqCst);
        }
    }

    impl HandshakeLines for Lines {
        fn set_local(&self, asserted: bool) {
            self.local.store(asserted, Ordering::SeqCst);
        }

        fn peer(&self) -> bool {
            self.peer.load(Ordering::SeqCst)
        }
    }

    type Event<'a> = Box<dyn FnMut(u32) + 'a>;

    /// Simulated time which runs a peer model on every tick
    struct SimClock<'a> {
        now: Cell<u32>,
        peer: RefCell<Event<'a>>,
    }

    impl<'a> SimClock<'a> {
        fn new(peer: impl FnMut(u32) + 'a) -> Self {
            SimClock {
                now: Cell::new(0),
                peer: RefCell::new(Box::new(peer)),
            }
        }
    }

    impl Clock for &SimClock<'_> {
        fn now_ms(&self) -> u32 {
            self.now.get()
        }

        fn delay_ms(&mut self, ms: u32) {
            for _ in 0..ms {
                self.now.set(self.now.get() + 1);
                let mut peer = self.peer.borrow_mut();
                (*peer)(self.now.get());
            }
        }
    }

    /// UART which feeds a canned reply into the pipe while transmitting
    struct EchoUart<'a, const N: usize> {
        sent: Vec<u8>,
        reply: &'a [u8],
        rx: &'a RxPipe<N>,
        lines: &'a Lines,
    }

    impl<const N: usize> embedded_io::ErrorType for EchoUart<'_, N> {
        type Error = std::convert::Infallible;
    }

    impl<const N: usize> Write for EchoUart<'_, N> {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.sent.extend_from_slice(buf);
            for byte in self.reply.iter().copied() {
                self.rx.on_byte(byte, self.lines);
            }
            self.reply = &[];
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn grant_timeout_sends_nothing() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|_| {});
        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };

        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::application_processor(),
            AbortSignal::new(),
        );

        assert_eq!(transport.send(b"hello"), Err(LinkError::GrantTimeout(20)));
        assert!(transport.uart.sent.is_empty());
        assert!(!lines.local());
        assert!(!rx.is_enabled());
        assert_eq!(clock.now.get(), 20);
    }

    #[test]
    fn reply_during_transmission_is_handed_up() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        // peer grants at once, releases two ticks after we let go
        let clock = SimClock::new(|now| {
            if now == 3 {
                lines.set_peer(false);
            }
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: b"ack",
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        let reply = transport.send(b"hello").unwrap();

        assert_eq!(reply.as_deref(), Some(&b"ack"[..]));
        assert_eq!(transport.uart.sent, b"hello".to_vec());
        assert!(!lines.local());
        assert!(!rx.is_enabled());
    }

    #[test]
    fn release_timeout_discards_reply() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|_| {});
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: b"partial",
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::battery_management_system(),
            AbortSignal::new(),
        );

        assert_eq!(transport.send(b"x"), Err(LinkError::ReleaseTimeout(100)));
        assert!(rx.is_empty());
        assert!(!rx.is_enabled());
    }

    #[test]
    fn receive_captures_until_peer_releases() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|now| match now {
            1..=4 => rx.on_byte(b"data"[now as usize - 1], &lines),
            5 => lines.set_peer(false),
            _ => {}
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        let captured = transport.receive().unwrap();
        assert_eq!(captured.as_deref(), Some(&b"data"[..]));
        assert!(!lines.local());
    }

    #[test]
    fn receive_overrun_is_reported() {
        let lines = Lines::default();
        let rx = RxPipe::<2>::new();
        let clock = SimClock::new(|now| match now {
            1..=3 => rx.on_byte(now as u8, &lines),
            4 => lines.set_peer(false),
            _ => {}
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        assert_eq!(transport.receive(), Err(LinkError::Overrun));
        assert!(rx.is_empty());
        assert!(!rx.is_enabled());
    }

    #[test]
    fn receive_overrun_ends_the_wait_at_once() {
        let lines = Lines::default();
        let rx = RxPipe::<2>::new();
        // peer overruns the buffer and then never lets go
        let clock = SimClock::new(|now| {
            if (1..=3).contains(&now) {
                rx.on_byte(now as u8, &lines);
            }
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        assert_eq!(transport.receive(), Err(LinkError::Overrun));
        assert_eq!(clock.now.get(), 3);
        assert!(!lines.local());
        assert!(!rx.is_enabled());
        assert!(rx.is_empty());
    }

    #[test]
    fn overrun_during_release_wait_ends_the_send() {
        let lines = Lines::default();
        let rx = RxPipe::<2>::new();
        let clock = SimClock::new(|_| {});
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: b"too long",
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        assert_eq!(transport.send(b"x"), Err(LinkError::Overrun));
        assert_eq!(transport.uart.sent, b"x".to_vec());
        assert_eq!(clock.now.get(), 0);
        assert!(!lines.local());
        assert!(!rx.is_enabled());
    }

    #[test]
    fn byte_arriving_just_after_release_is_kept() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|now| match now {
            1..=3 => rx.on_byte(b"dat"[now as usize - 1], &lines),
            4 => lines.set_peer(false),
            5 => rx.on_byte(b'a', &lines),
            _ => {}
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        let captured = transport.receive().unwrap();
        assert_eq!(captured.as_deref(), Some(&b"data"[..]));
        assert!(!rx.is_enabled());
    }

    #[test]
    fn reply_byte_arriving_just_after_release_is_kept() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|now| match now {
            3 => lines.set_peer(false),
            4 => rx.on_byte(b'k', &lines),
            _ => {}
        });
        lines.set_peer(true);

        let uart = EchoUart {
            sent: Vec::new(),
            reply: b"ac",
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        let reply = transport.send(b"hello").unwrap();
        assert_eq!(reply.as_deref(), Some(&b"ack"[..]));
        assert!(!rx.is_enabled());
    }

    #[test]
    fn glitch_on_request_line_is_rejected() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|_| {});

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            AbortSignal::new(),
        );

        assert_eq!(transport.receive(), Err(LinkError::Glitch));
        assert!(!lines.local());
    }

    #[test]
    fn abort_signal_ends_waits() {
        let lines = Lines::default();
        let rx = RxPipe::<16>::new();
        let clock = SimClock::new(|_| {});
        let abort = AbortSignal::new();
        abort.abort();

        let uart = EchoUart {
            sent: Vec::new(),
            reply: &[],
            rx: &rx,
            lines: &lines,
        };
        let mut transport = Transport::new(
            uart,
            &lines,
            &clock,
            &rx,
            HandshakeTimeouts::default(),
            abort,
        );

        assert_eq!(transport.send(b"x"), Err(LinkError::Aborted));
        assert!(!lines.local());
    }
}
