//! Serial I/O adapter contract (spec.md §1, §4.1, §6).
//!
//! The byte-level UART driver is out of scope for this crate: it is a
//! platform collaborator that calls into [`crate::rtu::RtuFrameEngine`] from
//! ISR context on every received byte and on transmit completion, and that
//! this crate calls into to start a transmission. Both directions are
//! modeled here as a single trait so a `TpContext` can be generic over it.

/// Platform hook for transmitting bytes on the wire.
///
/// Implementations must not block; `transmit` only *starts* emission. The
/// platform driver is expected to call
/// [`crate::tp::TpContext::on_transmit_complete`] once the last byte
/// (including the CRC) has been clocked out, typically from an ISR.
pub trait SerialIo {
    /// Begins transmitting `frame` (a complete RTU ADU: address + PDU + CRC).
    fn transmit(&mut self, frame: &[u8]);
}
