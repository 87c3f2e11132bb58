//! RTU Frame Engine (RFE) — spec.md §4.1.
//!
//! Delimits frames on the wire by inter-character silence, validates the
//! CRC-16, and builds outbound frames with address + CRC. This module only
//! implements the receive state machine and the wire encode/decode; the
//! transport-layer lifecycle (`IDLE`/`PROCESSING`/`TRANSMITTING`, buffer
//! ownership handoff) is [`crate::tp::TpContext`]'s job.

use heapless::Vec;
use log::trace;

use crate::crc;
use crate::error::BufferError;
use crate::timing::{elapsed, RtuTiming};
use crate::ADU_MAX_LEN;

/// Receive-side states from spec.md §4.1. `Processing` corresponds to the
/// spec's `PROCESSING`: the engine holds a validated frame until
/// [`RtuFrameEngine::reception_done`] releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Init,
    Idle,
    Receiving,
    CtrlWaiting,
    WaitIdle,
    Processing,
}

/// Why a frame never reached [`RtuOutcome::FrameReady`]. Surfaced so the
/// bound channel can feed its diagnostics counters (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// More bytes arrived than fit in one ADU.
    BufferOverflow,
    /// A byte arrived during what should have been inter-frame silence
    /// (t1.5 < gap ≤ t3.5), violating Modbus RTU's inter-character rule.
    InterCharacterViolation,
    /// Too few bytes for a minimal ADU (address + code + CRC).
    FrameTooShort,
    CrcMismatch,
    AddressMismatch,
}

/// Result of feeding bytes or a timer tick to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuOutcome {
    /// No frame boundary reached yet.
    Pending,
    /// A validated frame is ready; read it with
    /// [`RtuFrameEngine::rx_adu`] then call
    /// [`RtuFrameEngine::reception_done`].
    FrameReady,
    Dropped(DropReason),
}

/// Which node addresses a received frame is accepted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    /// Accept every address (used by clients: the expected responder is
    /// checked by the client orchestrator against the outstanding request,
    /// not by the frame engine — see spec.md §9 open question (a)).
    Any,
    /// Accept only frames addressed to `self` or broadcast (node 0) —
    /// spec.md §4.4's server-side addressing rule.
    SelfOrBroadcast(u8),
}

impl NodeFilter {
    fn accepts(self, node: u8) -> bool {
        match self {
            NodeFilter::Any => true,
            NodeFilter::SelfOrBroadcast(own) => node == own || node == 0,
        }
    }
}

/// The RTU Frame Engine: one instance per serial port.
pub struct RtuFrameEngine {
    state: RxState,
    rx: Vec<u8, ADU_MAX_LEN>,
    tx: Vec<u8, ADU_MAX_LEN>,
    last_byte_tick: u16,
    timing: RtuTiming,
    node_filter: NodeFilter,
    /// Set while `CtrlWaiting` if a byte arrives; forces the eventual seal
    /// to drop the frame regardless of what its CRC says.
    corrupt: bool,
}

impl RtuFrameEngine {
    pub fn new(now: u16, timing: RtuTiming, node_filter: NodeFilter) -> Self {
        Self {
            state: RxState::Init,
            rx: Vec::new(),
            tx: Vec::new(),
            last_byte_tick: now,
            timing,
            node_filter,
            corrupt: false,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, RxState::Idle)
    }

    /// Feeds newly received bytes, as delivered by
    /// [`crate::sio::SerialIo`]'s receive ISR (spec.md §4.1, §6). May be
    /// called with more than one byte at a time.
    pub fn on_bytes_received(&mut self, bytes: &[u8], now: u16) -> RtuOutcome {
        match self.state {
            // Buffer is owned by the channel until `reception_done`; a new
            // frame cannot start. Bytes are lost, matching spec's silence
            // on this edge case.
            RxState::Init | RxState::Processing => RtuOutcome::Pending,

            RxState::Idle => {
                self.rx.clear();
                self.corrupt = false;
                for &b in bytes {
                    let _ = self.rx.push(b);
                }
                self.last_byte_tick = now;
                self.state = RxState::Receiving;
                RtuOutcome::Pending
            }

            RxState::Receiving => {
                for &b in bytes {
                    if self.rx.push(b).is_err() {
                        self.rx.clear();
                        self.state = RxState::WaitIdle;
                        self.last_byte_tick = now;
                        return RtuOutcome::Dropped(DropReason::BufferOverflow);
                    }
                }
                self.last_byte_tick = now;
                RtuOutcome::Pending
            }

            RxState::CtrlWaiting => {
                // A byte during the t1.5..t3.5 window is itself the
                // violation; absorb it (and anything after) until silence,
                // but the eventual seal always drops the frame.
                self.corrupt = true;
                for &b in bytes {
                    let _ = self.rx.push(b);
                }
                self.last_byte_tick = now;
                self.state = RxState::Receiving;
                RtuOutcome::Pending
            }

            RxState::WaitIdle => {
                self.last_byte_tick = now;
                RtuOutcome::Pending
            }
        }
    }

    /// Advances the engine against the free-running timer; call this
    /// periodically (spec.md §4.3's "poll function") to detect the silence
    /// gaps that delimit frames.
    pub fn on_timer_tick(&mut self, now: u16) -> RtuOutcome {
        match self.state {
            RxState::Init => {
                if elapsed(now, self.last_byte_tick) > self.timing.t3_5 {
                    self.state = RxState::Idle;
                }
                RtuOutcome::Pending
            }

            RxState::Receiving => {
                let gap = elapsed(now, self.last_byte_tick);
                if gap > self.timing.t3_5 {
                    self.seal_frame()
                } else if gap > self.timing.t1_5 {
                    self.state = RxState::CtrlWaiting;
                    RtuOutcome::Pending
                } else {
                    RtuOutcome::Pending
                }
            }

            RxState::CtrlWaiting => {
                if elapsed(now, self.last_byte_tick) > self.timing.t3_5 {
                    self.seal_frame()
                } else {
                    RtuOutcome::Pending
                }
            }

            RxState::WaitIdle => {
                if elapsed(now, self.last_byte_tick) > self.timing.t3_5 {
                    self.rx.clear();
                    self.state = RxState::Idle;
                }
                RtuOutcome::Pending
            }

            RxState::Idle | RxState::Processing => RtuOutcome::Pending,
        }
    }

    fn seal_frame(&mut self) -> RtuOutcome {
        if self.corrupt {
            self.rx.clear();
            self.corrupt = false;
            self.state = RxState::WaitIdle;
            trace!("rtu: dropping frame, inter-character violation");
            return RtuOutcome::Dropped(DropReason::InterCharacterViolation);
        }
        if self.rx.len() < 4 {
            let len = self.rx.len();
            self.rx.clear();
            self.state = RxState::Idle;
            trace!("rtu: dropping frame, only {len} bytes received");
            return RtuOutcome::Dropped(DropReason::FrameTooShort);
        }
        if !crc::verify(&self.rx) {
            self.rx.clear();
            self.state = RxState::Idle;
            trace!("rtu: dropping frame, CRC mismatch");
            return RtuOutcome::Dropped(DropReason::CrcMismatch);
        }
        if !self.node_filter.accepts(self.rx[0]) {
            let node = self.rx[0];
            self.rx.clear();
            self.state = RxState::Idle;
            trace!("rtu: dropping frame addressed to node {node}");
            return RtuOutcome::Dropped(DropReason::AddressMismatch);
        }
        self.state = RxState::Processing;
        RtuOutcome::FrameReady
    }

    /// The validated ADU payload (`[node][code][data...]`, CRC stripped).
    /// Only meaningful while [`Self::state`] is [`RxState::Processing`].
    pub fn rx_adu(&self) -> &[u8] {
        let len = self.rx.len();
        if len < 2 {
            return &[];
        }
        &self.rx[..len - 2]
    }

    /// Releases the rx buffer back to the engine (spec.md §4.2
    /// `receptionDone`) and returns to `IDLE`.
    pub fn reception_done(&mut self) {
        self.rx.clear();
        self.state = RxState::Idle;
    }

    /// Builds an outbound ADU `[node][code][data...][crc_lo][crc_hi]` and
    /// returns it as a byte slice ready for [`crate::sio::SerialIo::transmit`].
    pub fn build_frame(
        &mut self,
        node: u8,
        code: u8,
        data: &[u8],
    ) -> Result<&[u8], BufferError> {
        self.tx.clear();
        self.tx.push(node).map_err(|_| BufferError::NoSpaceLeft)?;
        self.tx.push(code).map_err(|_| BufferError::NoSpaceLeft)?;
        self.tx
            .extend_from_slice(data)
            .map_err(|_| BufferError::NoSpaceLeft)?;
        let frame_crc = crc::calc_crc(&self.tx);
        self.tx
            .push((frame_crc & 0xFF) as u8)
            .map_err(|_| BufferError::NoSpaceLeft)?;
        self.tx
            .push((frame_crc >> 8) as u8)
            .map_err(|_| BufferError::NoSpaceLeft)?;
        Ok(&self.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RtuFrameEngine {
        let timing = RtuTiming { t1_5: 10, t3_5: 20 };
        RtuFrameEngine::new(0, timing, NodeFilter::SelfOrBroadcast(10))
    }

    fn framed(node: u8, code: u8, data: &[u8]) -> heapless::Vec<u8, 32> {
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.push(node).unwrap();
        buf.push(code).unwrap();
        buf.extend_from_slice(data).unwrap();
        let crc = crc::calc_crc(&buf);
        buf.push((crc & 0xFF) as u8).unwrap();
        buf.push((crc >> 8) as u8).unwrap();
        buf
    }

    #[test]
    fn init_waits_for_t3_5_before_going_idle() {
        let mut eng = engine();
        assert_eq!(eng.state(), RxState::Init);
        eng.on_timer_tick(15);
        assert_eq!(eng.state(), RxState::Init);
        eng.on_timer_tick(21);
        assert_eq!(eng.state(), RxState::Idle);
    }

    #[test]
    fn valid_frame_is_accepted() {
        let mut eng = engine();
        eng.on_timer_tick(21); // leave Init
        let frame = framed(10, 0x03, &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(eng.on_bytes_received(&frame, 100), RtuOutcome::Pending);
        assert_eq!(eng.on_timer_tick(121), RtuOutcome::FrameReady);
        assert_eq!(eng.state(), RxState::Processing);
        assert_eq!(eng.rx_adu(), &frame[..frame.len() - 2]);
        eng.reception_done();
        assert!(eng.is_idle());
    }

    #[test]
    fn mismatched_address_is_dropped() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        let frame = framed(11, 0x03, &[0, 0, 0, 1]);
        eng.on_bytes_received(&frame, 100);
        assert_eq!(
            eng.on_timer_tick(121),
            RtuOutcome::Dropped(DropReason::AddressMismatch)
        );
        assert!(eng.is_idle());
    }

    #[test]
    fn broadcast_is_always_accepted_by_server_filter() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        let frame = framed(0, 0x06, &[0, 0, 0, 0x7F]);
        eng.on_bytes_received(&frame, 100);
        assert_eq!(eng.on_timer_tick(121), RtuOutcome::FrameReady);
    }

    #[test]
    fn crc_corruption_is_dropped() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        let mut frame = framed(10, 0x03, &[0, 0, 0, 1]);
        frame[2] ^= 0x01;
        eng.on_bytes_received(&frame, 100);
        assert_eq!(
            eng.on_timer_tick(121),
            RtuOutcome::Dropped(DropReason::CrcMismatch)
        );
    }

    #[test]
    fn inter_character_gap_within_t1_5_keeps_receiving() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        let frame = framed(10, 0x03, &[0, 0, 0, 1]);
        eng.on_bytes_received(&frame[..2], 100);
        eng.on_timer_tick(105); // gap of 5, within t1.5=10
        assert_eq!(eng.state(), RxState::Receiving);
        eng.on_bytes_received(&frame[2..], 105);
        eng.on_timer_tick(205);
        assert_eq!(eng.state(), RxState::Processing);
    }

    #[test]
    fn gap_beyond_t1_5_but_within_t3_5_enters_ctrl_waiting() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        eng.on_bytes_received(&[10, 0x03], 100);
        eng.on_timer_tick(115); // gap 15: > t1.5(10), <= t3.5(20)
        assert_eq!(eng.state(), RxState::CtrlWaiting);
    }

    #[test]
    fn byte_during_ctrl_waiting_forces_drop_on_seal() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        eng.on_bytes_received(&[10, 0x03], 100);
        eng.on_timer_tick(115);
        assert_eq!(eng.state(), RxState::CtrlWaiting);
        eng.on_bytes_received(&[0, 0], 116);
        assert_eq!(eng.state(), RxState::Receiving);
        let outcome = eng.on_timer_tick(137);
        assert_eq!(
            outcome,
            RtuOutcome::Dropped(DropReason::InterCharacterViolation)
        );
        assert_eq!(eng.state(), RxState::WaitIdle);
    }

    #[test]
    fn buffer_overflow_drops_and_waits_for_idle() {
        let mut eng = engine();
        eng.on_timer_tick(21);
        let big = [0xAAu8; ADU_MAX_LEN + 1];
        let outcome = eng.on_bytes_received(&big, 100);
        assert_eq!(outcome, RtuOutcome::Dropped(DropReason::BufferOverflow));
        assert_eq!(eng.state(), RxState::WaitIdle);
    }

    #[test]
    fn build_frame_matches_crc_symmetry() {
        let mut eng = engine();
        let adu = eng.build_frame(10, 0x03, &[0x9C, 0x40, 0x00, 0x02]).unwrap();
        assert!(crc::verify(adu));
        assert_eq!(&adu[..5], &[10, 0x03, 0x9C, 0x40, 0x00]);
    }
}
