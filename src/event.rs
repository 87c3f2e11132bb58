//! Event Loop (EVT) — spec.md §4.3.
//!
//! A single process-wide queue carries everything that needs task-context
//! handling: a frame finished receiving, a transmission completed. ISRs
//! post into it; [`EventLoop::run_once`] drains one event per call, which
//! both scheduling models described in spec.md §5 can drive — a super-loop
//! calls it back-to-back, a preemptive task blocks on
//! [`crate::osal::Osal`] between calls.

use heapless::mpmc::MpMcQueue;

use crate::registry::{ChannelHandle, Registry};

/// What happened. Carries no payload: the receiving channel re-reads its
/// own state (rx packet, tx result) rather than the event carrying data,
/// matching spec.md's "the event only says *what*, not *what with*".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    FrameReceived,
    FrameTransmitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub channel: ChannelHandle,
}

/// Default event queue depth (SPEC_FULL.md §9 resolves the queue-depth open
/// question by leaving it a const generic with this default).
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 64;

/// Lock-free MPSC-ish queue: any number of ISRs enqueue, one event task
/// dequeues. `N` must be a power of two (a [`heapless::mpmc::MpMcQueue`]
/// requirement).
pub struct EventQueue<const N: usize = DEFAULT_EVENT_QUEUE_SIZE> {
    queue: MpMcQueue<Event, N>,
}

impl<const N: usize> EventQueue<N> {
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
        }
    }

    /// Posts an event. Safe to call from ISR context; never blocks. Returns
    /// `Err` if the queue is full, at which point the caller has nowhere
    /// left to put the event — spec.md leaves this a "should not happen in
    /// practice" condition given a correctly sized queue.
    pub fn post(&self, event: Event) -> Result<(), Event> {
        self.queue.enqueue(event)
    }

    pub fn pop(&self) -> Option<Event> {
        self.queue.dequeue()
    }
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains and dispatches events against a [`Registry`].
pub struct EventLoop<'a, const N: usize> {
    queue: &'a EventQueue<N>,
}

impl<'a, const N: usize> EventLoop<'a, N> {
    pub fn new(queue: &'a EventQueue<N>) -> Self {
        Self { queue }
    }

    /// One iteration: polls every registered channel's time-driven state,
    /// then dispatches at most one queued event. Returns `true` if an event
    /// was dispatched, so callers doing a busy-wait can tell whether they
    /// made progress.
    pub fn run_once<const M: usize>(&self, registry: &Registry<'_, M>, now: u16) -> bool {
        registry.poll_all(now);
        match self.queue.pop() {
            Some(event) => {
                if let Some(channel) = registry.get(event.channel) {
                    channel.process_event(event.id);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Counter {
        received: Cell<u32>,
    }

    impl crate::registry::ChannelProcessor for Counter {
        fn process_event(&self, id: EventId) {
            if id == EventId::FrameReceived {
                self.received.set(self.received.get() + 1);
            }
        }
        fn on_bytes_received(&self, _bytes: &[u8], _now: u16) {}
        fn on_transmit_complete(&self, _now: u16) {}
        fn poll(&self, _now: u16) {}
    }

    #[test]
    fn run_once_dispatches_one_event_to_the_right_channel() {
        let queue: EventQueue<4> = EventQueue::new();
        let counter = Counter {
            received: Cell::new(0),
        };
        let mut registry: Registry<'_, 2> = Registry::new();
        registry.register(ChannelHandle(0), &counter);

        queue
            .post(Event {
                id: EventId::FrameReceived,
                channel: ChannelHandle(0),
            })
            .unwrap();

        let event_loop = EventLoop::new(&queue);
        assert!(event_loop.run_once(&registry, 0));
        assert_eq!(counter.received.get(), 1);
        assert!(!event_loop.run_once(&registry, 0));
    }

    // Wires a real Server through Registry/EventLoop the way an integrator
    // would: bytes land via on_bytes_received, a poll sweep seals the frame
    // and posts the event, run_once dispatches it into handle_request.
    #[test]
    fn event_loop_drives_a_registered_server_end_to_end() {
        use crate::error::ServerFault;
        use crate::registry::ChannelProcessor;
        use crate::rtu::NodeFilter;
        use crate::server::{Server, ServerHandler};
        use crate::sio::SerialIo;
        use crate::timer::mock::MockTimer;
        use crate::tp::TpContext;

        struct NullSio;
        impl SerialIo for NullSio {
            fn transmit(&mut self, _frame: &[u8]) {}
        }

        struct OneRegister(u16);
        impl ServerHandler for OneRegister {
            fn read_coil(&mut self, _a: u16) -> Result<bool, ServerFault> {
                Err(ServerFault::IllegalDataAddress)
            }
            fn read_discrete_input(&mut self, _a: u16) -> Result<bool, ServerFault> {
                Err(ServerFault::IllegalDataAddress)
            }
            fn read_holding_register(&mut self, address: u16) -> Result<u16, ServerFault> {
                if address == 0 {
                    Ok(self.0)
                } else {
                    Err(ServerFault::IllegalDataAddress)
                }
            }
            fn read_input_register(&mut self, _a: u16) -> Result<u16, ServerFault> {
                Err(ServerFault::IllegalDataAddress)
            }
            fn write_coil(&mut self, _a: u16, _v: bool) -> Result<(), ServerFault> {
                Err(ServerFault::IllegalDataAddress)
            }
            fn write_holding_register(&mut self, _a: u16, _v: u16) -> Result<(), ServerFault> {
                Err(ServerFault::IllegalDataAddress)
            }
        }

        let events: EventQueue<4> = EventQueue::new();
        let tp = TpContext::new(NullSio, MockTimer::new(0), 19200, NodeFilter::SelfOrBroadcast(1));
        let server = Server::new(tp, OneRegister(0x00AA), &events, ChannelHandle(0));

        let mut registry: Registry<'_, 1> = Registry::new();
        registry.register(ChannelHandle(0), &server);

        server.poll(2000); // clear INIT

        let mut req = heapless::Vec::<u8, 16>::new();
        req.extend_from_slice(&[1, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        let crc = crate::crc::calc_crc(&req);
        req.push((crc & 0xFF) as u8).unwrap();
        req.push((crc >> 8) as u8).unwrap();

        server.on_bytes_received(&req, 2100);
        let gap = crate::timing::RtuTiming::from_baud_rate(19200).t3_5;
        let now = 2100u16.wrapping_add(gap + 1);

        let event_loop = EventLoop::new(&events);
        assert!(event_loop.run_once(&registry, now));

        assert_eq!(server.bus_message_count(), 1);
        assert_eq!(server.server_message_count(), 1);
    }
}
