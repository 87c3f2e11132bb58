//! t1.5 / t3.5 derivation and wrapping tick arithmetic (spec.md §4.1, §5).
//!
//! The only time source is a free-running 16-bit counter ticking at 20 kHz
//! (50 microseconds per tick). All durations are computed with wrapping
//! unsigned subtraction, so a rollover of the counter never produces a
//! spuriously huge elapsed time.

/// Ticks per second of the timer (20 kHz).
pub const TICKS_PER_SECOND: u32 = 20_000;

/// Number of bit times in one Modbus RTU character: 1 start + 8 data +
/// parity/fill + 1 stop.
const BITS_PER_CHARACTER: u32 = 11;

/// Inter-character (t1.5) and inter-frame (t3.5) silence thresholds, in
/// 50 microsecond ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtuTiming {
    pub t1_5: u16,
    pub t3_5: u16,
}

impl RtuTiming {
    /// Derives t1.5/t3.5 from a baud rate, per spec.md §4.1: above 19200
    /// baud the Modbus spec fixes t1.5 = 750 us and t3.5 = 1.75 ms.
    pub fn from_baud_rate(baud_rate: u32) -> Self {
        if baud_rate > 19_200 {
            Self {
                t1_5: micros_to_ticks(750),
                t3_5: micros_to_ticks(1_750),
            }
        } else {
            let char_time_us = (BITS_PER_CHARACTER as u64 * 1_000_000) / baud_rate as u64;
            Self {
                t1_5: micros_to_ticks((char_time_us * 3 / 2) as u32),
                t3_5: micros_to_ticks((char_time_us * 7 / 2) as u32),
            }
        }
    }
}

fn micros_to_ticks(micros: u32) -> u16 {
    // 1 tick = 50 us, so ticks = micros / 50, rounded up so the threshold is
    // never shorter than the real Modbus-mandated silence period.
    (micros.div_ceil(50)).min(u16::MAX as u32) as u16
}

/// Wrapping elapsed time between two 16-bit tick counts: `now - then`.
pub fn elapsed(now: u16, then: u16) -> u16 {
    now.wrapping_sub(then)
}
