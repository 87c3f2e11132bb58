//! Channel registry — spec.md §9's replacement for the original's cyclic
//! `TpContext <-> channel` pointers.
//!
//! A channel (server or client) is identified by a small [`ChannelHandle`]
//! index rather than a pointer. [`Registry`] is a fixed-capacity table of
//! `&dyn ChannelProcessor` built once at startup; the event loop and the
//! serial ISR both address channels through it, so nothing needs a back-
//! pointer to "the thing that owns this transport".

use crate::event::EventId;

/// Index into a [`Registry`]. `Copy` so it can be embedded in an
/// [`crate::event::Event`] without borrowing the channel it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle(pub u8);

/// What a registered channel (client or server) exposes to the event loop
/// and to the serial ISR. All methods take `&self`: a channel's mutable
/// state lives behind interior mutability ([`core::cell::RefCell`]) so a
/// client's own blocking wait can safely re-enter the event loop that ends
/// up calling back into that same channel (spec.md §4.3).
pub trait ChannelProcessor {
    /// Dispatches a queued event (spec.md §4.3 `eventTask`).
    fn process_event(&self, id: EventId);

    /// Forwards bytes from the serial ISR into this channel's frame engine.
    fn on_bytes_received(&self, bytes: &[u8], now: u16);

    /// Notifies this channel that its last transmission finished.
    fn on_transmit_complete(&self, now: u16);

    /// Polls time-driven state (t1.5/t3.5 gap detection, response
    /// timeouts) — spec.md §4.3's "poll function" for transports without a
    /// dedicated hardware timer interrupt.
    fn poll(&self, now: u16);
}

/// Fixed-capacity table of registered channels, indexed by [`ChannelHandle`].
pub struct Registry<'a, const N: usize> {
    channels: [Option<&'a dyn ChannelProcessor>; N],
}

impl<'a, const N: usize> Registry<'a, N> {
    pub const fn new() -> Self {
        Self {
            channels: [None; N],
        }
    }

    /// Registers `channel` at `handle`, replacing whatever was there.
    pub fn register(&mut self, handle: ChannelHandle, channel: &'a dyn ChannelProcessor) {
        self.channels[handle.0 as usize] = Some(channel);
    }

    pub fn get(&self, handle: ChannelHandle) -> Option<&'a dyn ChannelProcessor> {
        self.channels.get(handle.0 as usize).copied().flatten()
    }

    /// Calls `poll` on every registered channel (spec.md §4.3's pollFcn
    /// sweep).
    pub fn poll_all(&self, now: u16) {
        for channel in self.channels.iter().flatten() {
            channel.poll(now);
        }
    }
}

impl<const N: usize> Default for Registry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}
