//! Transport-Layer Context (TPC) — spec.md §3, §4.2.
//!
//! Owns one serial port's frame engine plus the rx/tx packet buffers, and
//! exposes the four operations spec.md's transport contract asks for:
//! `transmit`, `getRxPacket`, `getTxPacket`, `receptionDone`. The original's
//! four function pointers become the [`TransportChannel`] trait; RTU is the
//! only implementation today, but nothing above this module assumes that.
//!
//! All methods take `&self`: [`core::cell::RefCell`] guards the mutable
//! state so a channel can be driven both from the serial ISR
//! (`on_bytes_received`, `on_transmit_complete`) and from task context
//! (`process_event`) without the two ever needing simultaneous `&mut`
//! access to the same object — the classic embedded "state shared with an
//! interrupt handler" shape.

use core::cell::RefCell;

use crate::packet::Packet;
use crate::rtu::{NodeFilter, RtuFrameEngine, RtuOutcome};
use crate::sio::SerialIo;
use crate::timer::TimerSource;
use crate::timing::RtuTiming;

/// Coarse transport state, mirroring spec.md §3's `TpContext.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpState {
    Idle,
    Receiving,
    Processing,
    Transmitting,
}

/// Outcome of feeding the frame engine a byte batch or a timer tick, already
/// folded into the transport's view of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpEvent {
    FrameReady,
    FrameDropped(crate::rtu::DropReason),
    TransmitComplete,
    None,
}

struct Inner<S, T> {
    sio: S,
    timer: T,
    engine: RtuFrameEngine,
    state: TpState,
    rx_packet: Packet,
    tx_packet: Packet,
}

/// One serial port's transport context, generic over the platform's UART
/// driver and timer source.
pub struct TpContext<S: SerialIo, T: TimerSource> {
    inner: RefCell<Inner<S, T>>,
}

impl<S: SerialIo, T: TimerSource> TpContext<S, T> {
    pub fn new(sio: S, timer: T, baud_rate: u32, node_filter: NodeFilter) -> Self {
        let now = timer.now();
        let timing = RtuTiming::from_baud_rate(baud_rate);
        Self {
            inner: RefCell::new(Inner {
                sio,
                timer,
                engine: RtuFrameEngine::new(now, timing, node_filter),
                state: TpState::Idle,
                rx_packet: Packet::new(0, 0),
                tx_packet: Packet::new(0, 0),
            }),
        }
    }

    pub fn state(&self) -> TpState {
        self.inner.borrow().state
    }

    /// Forwards bytes from the serial ISR. Returns an event if a frame
    /// boundary was reached synchronously.
    pub fn on_bytes_received(&self, bytes: &[u8], now: u16) -> TpEvent {
        let mut inner = self.inner.borrow_mut();
        inner.state = TpState::Receiving;
        match inner.engine.on_bytes_received(bytes, now) {
            RtuOutcome::Pending => TpEvent::None,
            RtuOutcome::FrameReady => Self::accept_ready_frame(&mut inner),
            RtuOutcome::Dropped(reason) => {
                inner.state = TpState::Idle;
                TpEvent::FrameDropped(reason)
            }
        }
    }

    /// Advances time-driven engine state; call periodically from the event
    /// loop's poll sweep.
    pub fn poll(&self, now: u16) -> TpEvent {
        let mut inner = self.inner.borrow_mut();
        match inner.engine.on_timer_tick(now) {
            RtuOutcome::Pending => TpEvent::None,
            RtuOutcome::FrameReady => Self::accept_ready_frame(&mut inner),
            RtuOutcome::Dropped(reason) => {
                inner.state = TpState::Idle;
                TpEvent::FrameDropped(reason)
            }
        }
    }

    fn accept_ready_frame(inner: &mut Inner<S, T>) -> TpEvent {
        let adu = inner.engine.rx_adu();
        if inner.rx_packet.load_from_adu_payload(adu).is_err() {
            inner.engine.reception_done();
            inner.state = TpState::Idle;
            return TpEvent::FrameDropped(crate::rtu::DropReason::FrameTooShort);
        }
        inner.state = TpState::Processing;
        TpEvent::FrameReady
    }

    /// Reads the packet decoded from the last accepted frame.
    pub fn with_rx_packet<R>(&self, f: impl FnOnce(&Packet) -> R) -> R {
        f(&self.inner.borrow().rx_packet)
    }

    /// Mutates the packet to transmit next.
    pub fn with_tx_packet<R>(&self, f: impl FnOnce(&mut Packet) -> R) -> R {
        f(&mut self.inner.borrow_mut().tx_packet)
    }

    /// Releases ownership of the rx buffer back to the frame engine
    /// (spec.md §4.2 `receptionDone`).
    pub fn reception_done(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.engine.reception_done();
        inner.state = TpState::Idle;
    }

    /// Builds and starts transmitting the current tx packet as an RTU ADU.
    pub fn transmit(&self) -> Result<(), crate::error::BufferError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let node = inner.tx_packet.node();
        let code = inner.tx_packet.code();
        let frame = inner
            .engine
            .build_frame(node, code, inner.tx_packet.data())?;
        inner.state = TpState::Transmitting;
        inner.sio.transmit(frame);
        Ok(())
    }

    /// Notifies the context that the serial driver finished transmitting.
    pub fn on_transmit_complete(&self) -> TpEvent {
        let mut inner = self.inner.borrow_mut();
        inner.state = TpState::Idle;
        TpEvent::TransmitComplete
    }

    pub fn now(&self) -> u16 {
        self.inner.borrow().timer.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::mock::MockTimer;

    struct NullSio;
    impl SerialIo for NullSio {
        fn transmit(&mut self, _frame: &[u8]) {}
    }

    #[test]
    fn receiving_a_valid_frame_reaches_processing() {
        let tp = TpContext::new(NullSio, MockTimer::new(0), 19200, NodeFilter::Any);
        // Past INIT's t3.5 wait.
        tp.poll(2000);
        let mut frame = heapless::Vec::<u8, 16>::new();
        frame.extend_from_slice(&[0x11, 0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        let crc = crate::crc::calc_crc(&frame);
        frame.push((crc & 0xFF) as u8).unwrap();
        frame.push((crc >> 8) as u8).unwrap();

        assert_eq!(tp.on_bytes_received(&frame, 2100), TpEvent::None);
        let gap = crate::timing::RtuTiming::from_baud_rate(19200).t3_5;
        let event = tp.poll(2100u16.wrapping_add(gap + 1));
        assert_eq!(event, TpEvent::FrameReady);
        assert_eq!(tp.state(), TpState::Processing);
        tp.with_rx_packet(|pkt| {
            assert_eq!(pkt.node(), 0x11);
            assert_eq!(pkt.code(), 0x03);
        });
        tp.reception_done();
        assert_eq!(tp.state(), TpState::Idle);
    }
}
