use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
    MutexGuard,
    PoisonError,
};

use heapless::Vec as HVec;

use super::HandshakeLines;

/// Byte accumulator shared between the receive interrupt and the main loop
///
/// The interrupt only appends while the pipe is enabled, and the main loop
/// only drains it after disabling it, so the two never touch the buffer
/// concurrently.
#[derive(Debug, Default)]
pub struct RxPipe<const N: usize> {
    buf: Mutex<HVec<u8, N>>,
    enabled: AtomicBool,
    aborted: AtomicBool,
    transmitting: AtomicBool,
}

impl<const N: usize> RxPipe<N> {
    pub fn new() -> Self {
        RxPipe {
            buf: Mutex::new(HVec::new()),
            enabled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            transmitting: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HVec<u8, N>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive interrupt entry point.
    pub fn on_byte<L: HandshakeLines + ?Sized>(&self, byte: u8, lines: &L) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }

        let mut buf = self.lock();
        // capture started, the sender may let go of the channel
        if buf.is_empty() && !self.transmitting.load(Ordering::Acquire) {
            lines.set_local(false);
        }

        if buf.push(byte).is_err() {
            buf.clear();
            self.aborted.store(true, Ordering::Release);
            self.enabled.store(false, Ordering::Release);
        }
    }

    /// Unmask the receive interrupt for a new exchange.
    pub fn enable(&self) {
        self.aborted.store(false, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    /// Mask the receive interrupt.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Mark the current exchange as failed; whatever it captured is discarded.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn set_transmitting(&self, transmitting: bool) {
        self.transmitting.store(transmitting, Ordering::Release);
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Acquire)
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the accumulated bytes. Only call this while disabled.
    pub fn take(&self) -> HVec<u8, N> {
        std::mem::take(&mut *self.lock())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::link::tests::Lines;

    #[test]
    fn masked_pipe_ignores_bytes() {
        let lines = Lines::default();
        let pipe = RxPipe::<4>::new();

        pipe.on_byte(0x42, &lines);
        assert!(pipe.is_empty());
    }

    #[test]
    fn first_byte_drops_ready_unless_transmitting() {
        let lines = Lines::default();
        let pipe = RxPipe::<4>::new();

        lines.set_local(true);
        pipe.enable();
        pipe.set_transmitting(true);
        pipe.on_byte(1, &lines);
        assert!(lines.local());

        pipe.disable();
        pipe.take();
        pipe.set_transmitting(false);
        pipe.enable();
        pipe.on_byte(2, &lines);
        assert!(!lines.local());
        // only the first byte of a burst touches the line
        lines.set_local(true);
        pipe.on_byte(3, &lines);
        assert!(lines.local());
    }

    #[test]
    fn overflow_discards_and_masks() {
        let lines = Lines::default();
        let pipe = RxPipe::<2>::new();

        pipe.enable();
        for byte in 0..3 {
            pipe.on_byte(byte, &lines);
        }

        assert!(pipe.is_aborted());
        assert!(!pipe.is_enabled());
        assert!(pipe.is_empty());

        pipe.on_byte(9, &lines);
        assert_eq!(pipe.take().as_slice(), &[] as &[u8]);
    }
}
