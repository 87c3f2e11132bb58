//! Client Orchestrator (CLI) — spec.md §4.2, with write-multiple and custom
//! function support folded in per SPEC_FULL.md's client supplement.
//!
//! A request is synchronous from the caller's point of view: build it,
//! transmit it, block until either a matching response arrives or a
//! timeout expires, validate, return. The blocking step goes through
//! [`Osal::wait`], whose default implementation re-enters this channel's
//! own polling (suiting a bare super-loop with no separate event task);
//! [`crate::osal::PreemptiveOsal`] overrides it with a real blocking wait,
//! relying on a separately-running event task to call
//! [`Client::process_event`] and wake it.

use core::cell::Cell;

use heapless::Vec;
use log::warn;

use crate::bits::{pack_bits, packed_byte_count, BitSet, RegisterIter};
use crate::error::ClientError;
use crate::event::EventId;
use crate::function::FunctionCode;
use crate::osal::Osal;
use crate::packet::Packet;
use crate::registry::ChannelProcessor;
use crate::sio::SerialIo;
use crate::timer::TimerSource;
use crate::timing;
use crate::tp::{TpContext, TpEvent};

/// 20 kHz ticks per millisecond (spec.md §1's free-running timer rate).
const TICKS_PER_MS: u32 = 20;

fn ms_to_ticks(ms: u32) -> u16 {
    ms.saturating_mul(TICKS_PER_MS).min(u16::MAX as u32) as u16
}

/// A Modbus RTU client bound to one transport channel.
pub struct Client<S: SerialIo, T: TimerSource, O: Osal> {
    tp: TpContext<S, T>,
    osal: O,
    response_timeout_ticks: u16,
    turnaround_delay_ticks: u16,
    busy: Cell<bool>,
    /// `(node, code)` of the request currently awaiting a reply, so the
    /// transport's frame-ready notifications can tell a matching response
    /// from a stray frame addressed to someone else on the bus.
    outstanding: Cell<Option<(u8, u8)>>,
}

impl<S: SerialIo, T: TimerSource, O: Osal> Client<S, T, O> {
    pub fn new(
        tp: TpContext<S, T>,
        osal: O,
        response_timeout_ms: u32,
        turnaround_delay_ms: u32,
    ) -> Self {
        Self {
            tp,
            osal,
            response_timeout_ticks: ms_to_ticks(response_timeout_ms),
            turnaround_delay_ticks: ms_to_ticks(turnaround_delay_ms),
            busy: Cell::new(false),
            outstanding: Cell::new(None),
        }
    }

    pub fn read_coils(&self, node: u8, address: u16, quantity: u16) -> Result<Vec<bool, 2000>, ClientError> {
        self.read_bits(node, FunctionCode::ReadCoils.code(), address, quantity)
    }

    pub fn read_discrete_inputs(
        &self,
        node: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool, 2000>, ClientError> {
        self.read_bits(node, FunctionCode::ReadDiscreteInputs.code(), address, quantity)
    }

    fn read_bits(
        &self,
        node: u8,
        code: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool, 2000>, ClientError> {
        if !(1..=2000).contains(&quantity) {
            return Err(ClientError::ParameterOutOfRange);
        }
        let response = self.request(node, code, |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(quantity)
        })?;
        if node == Packet::BROADCAST {
            return Ok(Vec::new());
        }
        let byte_count = response.get_u8(0).ok_or(ClientError::MalformedResponse)?;
        if byte_count != packed_byte_count(quantity) {
            return Err(ClientError::MalformedResponse);
        }
        let bits: Vec<bool, 2000> = BitSet::new(&response.data()[1..])
            .take(quantity as usize)
            .collect();
        Ok(bits)
    }

    pub fn read_holding_registers(
        &self,
        node: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16, 125>, ClientError> {
        self.read_registers(node, FunctionCode::ReadHoldingRegisters.code(), address, quantity)
    }

    pub fn read_input_registers(
        &self,
        node: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16, 125>, ClientError> {
        self.read_registers(node, FunctionCode::ReadInputRegisters.code(), address, quantity)
    }

    fn read_registers(
        &self,
        node: u8,
        code: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16, 125>, ClientError> {
        if !(1..=125).contains(&quantity) {
            return Err(ClientError::ParameterOutOfRange);
        }
        let response = self.request(node, code, |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(quantity)
        })?;
        if node == Packet::BROADCAST {
            return Ok(Vec::new());
        }
        let byte_count = response.get_u8(0).ok_or(ClientError::MalformedResponse)?;
        if byte_count as u16 != quantity * 2 {
            return Err(ClientError::MalformedResponse);
        }
        let regs: Vec<u16, 125> = RegisterIter::new(&response.data()[1..])
            .take(quantity as usize)
            .collect();
        Ok(regs)
    }

    pub fn write_single_coil(&self, node: u8, address: u16, value: bool) -> Result<(), ClientError> {
        let raw = if value { 0xFF00 } else { 0x0000 };
        let response = self.request(node, FunctionCode::WriteSingleCoil.code(), |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(raw)
        })?;
        if node == Packet::BROADCAST {
            return Ok(());
        }
        if response.get_u16(0) != Some(address) || response.get_u16(2) != Some(raw) {
            return Err(ClientError::MalformedResponse);
        }
        Ok(())
    }

    pub fn write_single_register(&self, node: u8, address: u16, value: u16) -> Result<(), ClientError> {
        let response = self.request(node, FunctionCode::WriteSingleRegister.code(), |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(value)
        })?;
        if node == Packet::BROADCAST {
            return Ok(());
        }
        if response.get_u16(0) != Some(address) || response.get_u16(2) != Some(value) {
            return Err(ClientError::MalformedResponse);
        }
        Ok(())
    }

    pub fn write_multiple_coils(&self, node: u8, address: u16, values: &[bool]) -> Result<(), ClientError> {
        let quantity = values.len() as u16;
        if !(1..=1968).contains(&quantity) {
            return Err(ClientError::ParameterOutOfRange);
        }
        let byte_count = packed_byte_count(quantity);
        let response = self.request(node, FunctionCode::WriteMultipleCoils.code(), |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(quantity)?;
            pdu.push_u8(byte_count)?;
            let mut packed = [0u8; 246];
            pack_bits(values.iter().copied(), &mut packed);
            pdu.extend_from_slice(&packed[..byte_count as usize])
        })?;
        if node == Packet::BROADCAST {
            return Ok(());
        }
        if response.get_u16(0) != Some(address) || response.get_u16(2) != Some(quantity) {
            return Err(ClientError::MalformedResponse);
        }
        Ok(())
    }

    pub fn write_multiple_registers(
        &self,
        node: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), ClientError> {
        let quantity = values.len() as u16;
        if !(1..=123).contains(&quantity) {
            return Err(ClientError::ParameterOutOfRange);
        }
        let byte_count = (quantity * 2) as u8;
        let response = self.request(node, FunctionCode::WriteMultipleRegisters.code(), |pdu| {
            pdu.push_u16(address)?;
            pdu.push_u16(quantity)?;
            pdu.push_u8(byte_count)?;
            for &value in values {
                pdu.push_u16(value)?;
            }
            Ok(())
        })?;
        if node == Packet::BROADCAST {
            return Ok(());
        }
        if response.get_u16(0) != Some(address) || response.get_u16(2) != Some(quantity) {
            return Err(ClientError::MalformedResponse);
        }
        Ok(())
    }

    /// Sends a request with a function code outside the standard set and
    /// returns the raw response packet for the caller to interpret.
    pub fn custom_function(&self, node: u8, code: u8, request_data: &[u8]) -> Result<Packet, ClientError> {
        self.request(node, code, |pdu| pdu.extend_from_slice(request_data))
    }

    fn request(
        &self,
        node: u8,
        code: u8,
        build: impl FnOnce(&mut Packet) -> Result<(), crate::error::BufferError>,
    ) -> Result<Packet, ClientError> {
        if self.busy.replace(true) {
            return Err(ClientError::TransportBusy);
        }
        let result = self.request_inner(node, code, build);
        self.busy.set(false);
        result
    }

    fn request_inner(
        &self,
        node: u8,
        code: u8,
        build: impl FnOnce(&mut Packet) -> Result<(), crate::error::BufferError>,
    ) -> Result<Packet, ClientError> {
        self.tp.with_tx_packet(|pdu| {
            pdu.clear();
            pdu.set_node(node);
            pdu.set_code(code);
            build(pdu)
        })?;
        self.tp.transmit()?;

        let is_broadcast = node == Packet::BROADCAST;
        let timeout_ticks = if is_broadcast {
            self.turnaround_delay_ticks
        } else {
            self.response_timeout_ticks
        };

        if is_broadcast {
            // No response is expected; the turnaround delay just keeps the
            // transmit slot held so the next request doesn't collide with
            // slaves still acting on this one (spec.md §4.2).
            self.wait_turnaround(timeout_ticks);
            return Ok(Packet::new(0, 0));
        }

        self.outstanding.set(Some((node, code)));
        let received = self.wait_response(timeout_ticks);
        self.outstanding.set(None);

        if !received {
            warn!("client: node {node} did not respond to {code:#04x} within the timeout");
            return Err(ClientError::Timeout);
        }

        // Only a frame whose node and function code already matched this
        // outstanding request ever reaches here (see `check_reply`):
        // node/function-code mismatches are discarded while still waiting,
        // per spec.md §4.5 step 5. `MalformedResponse` is reserved for a
        // genuinely ill-shaped reply from the right node/function.
        let response = self.tp.with_rx_packet(|pkt| pkt.clone());
        self.tp.reception_done();

        if response.is_exception() {
            let exception = response.get_u8(0).unwrap_or(0);
            warn!("client: node {node} returned exception {exception:#04x} for {code:#04x}");
            return Err(ClientError::Exception(exception));
        }
        Ok(response)
    }

    /// Whether `pkt` is the reply to the currently outstanding request: same
    /// node, and the same function code either echoed back or with the
    /// exception bit set.
    fn matches_outstanding(&self, pkt: &Packet) -> bool {
        match self.outstanding.get() {
            Some((node, code)) => pkt.node() == node && (pkt.code() == code || pkt.code() == code | 0x80),
            None => false,
        }
    }

    /// Called when the transport has a freshly sealed frame. Wakes the
    /// waiter if it matches the outstanding request; otherwise discards it
    /// and leaves the waiter polling out its remaining timeout.
    fn check_reply(&self) {
        let matches = self.tp.with_rx_packet(|pkt| self.matches_outstanding(pkt));
        if matches {
            self.osal.give();
        } else {
            self.tp.reception_done();
        }
    }

    fn pump(&self) {
        let now = self.tp.now();
        if let TpEvent::FrameReady = self.tp.poll(now) {
            self.check_reply();
        }
    }

    fn wait_response(&self, timeout_ticks: u16) -> bool {
        let tp = &self.tp;
        let now = || tp.now();
        self.osal.wait(timeout_ticks, &now, || self.pump())
    }

    fn wait_turnaround(&self, ticks: u16) {
        let start = self.tp.now();
        while timing::elapsed(self.tp.now(), start) < ticks {
            self.pump();
        }
    }
}

impl<S: SerialIo, T: TimerSource, O: Osal> ChannelProcessor for Client<S, T, O> {
    fn process_event(&self, id: EventId) {
        if id == EventId::FrameReceived {
            self.check_reply();
        }
    }

    fn on_bytes_received(&self, bytes: &[u8], now: u16) {
        let _ = self.tp.on_bytes_received(bytes, now);
    }

    fn on_transmit_complete(&self, _now: u16) {
        self.tp.on_transmit_complete();
    }

    fn poll(&self, now: u16) {
        if let TpEvent::FrameReady = self.tp.poll(now) {
            self.check_reply();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osal::SuperloopOsal;
    use crate::rtu::NodeFilter;
    use crate::timer::mock::MockTimer;

    struct NullSio;
    impl SerialIo for NullSio {
        fn transmit(&mut self, _frame: &[u8]) {}
    }

    fn framed(node: u8, code: u8, data: &[u8]) -> heapless::Vec<u8, 32> {
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.push(node).unwrap();
        buf.push(code).unwrap();
        buf.extend_from_slice(data).unwrap();
        let crc = crate::crc::calc_crc(&buf);
        buf.push((crc & 0xFF) as u8).unwrap();
        buf.push((crc >> 8) as u8).unwrap();
        buf
    }

    #[test]
    fn read_holding_registers_times_out_with_no_reply() {
        let timer = MockTimer::new(0);
        let tp = TpContext::new(NullSio, &timer, 19200, NodeFilter::Any);
        tp.poll(2000); // clear INIT
        let client = Client::new(tp, SuperloopOsal::new(), 5, 5);
        let err = client.read_holding_registers(10, 0, 2).unwrap_err();
        assert_eq!(err, ClientError::Timeout);
    }

    #[test]
    fn read_holding_registers_returns_decoded_values_once_reply_arrives() {
        let _ = env_logger::try_init();
        let timer = MockTimer::new(0);
        let tp = TpContext::new(NullSio, &timer, 19200, NodeFilter::Any);
        tp.poll(2000); // clear INIT

        // Place the reply on the wire now, positioned so the engine seals
        // it exactly when the client's first wait-loop pump polls: the
        // timer is advanced up front rather than mid-wait since MockTimer
        // does not tick on its own.
        let reply = framed(10, 0x03, &[0x04, 0x00, 0x2A, 0x00, 0x2B]);
        tp.on_bytes_received(&reply, 2100);
        let gap = crate::timing::RtuTiming::from_baud_rate(19200).t3_5;
        timer.set(2100u16.wrapping_add(gap + 1));

        let client = Client::new(tp, SuperloopOsal::new(), 50, 5);
        let regs = client.read_holding_registers(10, 0, 2).unwrap();
        assert_eq!(regs.as_slice(), &[0x002A, 0x002B]);
    }

    #[test]
    fn exception_response_is_recognized_and_reported() {
        let timer = MockTimer::new(0);
        let tp = TpContext::new(NullSio, &timer, 19200, NodeFilter::Any);
        tp.poll(2000); // clear INIT

        let reply = framed(10, 0x83, &[0x02]);
        tp.on_bytes_received(&reply, 2100);
        let gap = crate::timing::RtuTiming::from_baud_rate(19200).t3_5;
        timer.set(2100u16.wrapping_add(gap + 1));

        let client = Client::new(tp, SuperloopOsal::new(), 50, 5);
        let err = client.read_holding_registers(10, 0, 1).unwrap_err();
        assert_eq!(err, ClientError::Exception(0x02));
    }

    // A frame addressed to a different node (entirely normal on a shared
    // multidrop bus) must be discarded rather than waking the waiter or
    // failing the request outright.
    #[test]
    fn mismatched_node_is_discarded_not_given() {
        let timer = MockTimer::new(0);
        let tp = TpContext::new(NullSio, &timer, 19200, NodeFilter::Any);
        tp.poll(2000); // clear INIT

        let reply = framed(11, 0x03, &[0x02, 0x00, 0x01]);
        tp.on_bytes_received(&reply, 2100);
        let gap = crate::timing::RtuTiming::from_baud_rate(19200).t3_5;
        let now = 2100u16.wrapping_add(gap + 1);

        let client = Client::new(tp, SuperloopOsal::new(), 50, 5);
        client.outstanding.set(Some((10, 0x03)));
        client.poll(now);

        assert!(!client.osal.try_take(), "mismatched frame must not wake the waiter");
        assert_eq!(client.tp.state(), crate::tp::TpState::Idle, "mismatched frame must be discarded");
    }
}
