//! Server Dispatcher (SRV) — spec.md §4.4.
//!
//! Routes a decoded request to a [`ServerHandler`] implementation, encodes
//! the reply (or an exception), and maintains the standard Modbus serial
//! line diagnostics counters FC08 exposes.

use core::cell::{Cell, RefCell};

use log::{debug, warn};

use crate::bits::{packed_byte_count, BitSet, RegisterIter};
pub use crate::error::ServerFault;
use crate::event::{Event, EventId, EventQueue};
use crate::function::{DiagnosticsSubcode, ExceptionCode, FunctionCode};
use crate::packet::Packet;
use crate::registry::{ChannelHandle, ChannelProcessor};
use crate::sio::SerialIo;
use crate::timer::TimerSource;
use crate::tp::TpContext;

impl From<ServerFault> for ExceptionCode {
    fn from(value: ServerFault) -> Self {
        match value {
            ServerFault::IllegalFunction => ExceptionCode::IllegalFunction,
            ServerFault::IllegalDataAddress => ExceptionCode::IllegalDataAddress,
            ServerFault::IllegalDataValue => ExceptionCode::IllegalDataValue,
            ServerFault::DeviceFailure => ExceptionCode::ServerDeviceFailure,
        }
    }
}

/// The data model a server channel exposes. One method per addressable
/// object type, plus a catch-all for function codes the standard set
/// doesn't cover (spec.md §4.4 "custom-function catch-all").
pub trait ServerHandler {
    fn read_coil(&mut self, address: u16) -> Result<bool, ServerFault>;
    fn read_discrete_input(&mut self, address: u16) -> Result<bool, ServerFault>;
    fn read_holding_register(&mut self, address: u16) -> Result<u16, ServerFault>;
    fn read_input_register(&mut self, address: u16) -> Result<u16, ServerFault>;
    fn write_coil(&mut self, address: u16, value: bool) -> Result<(), ServerFault>;
    fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), ServerFault>;

    /// Handles a function code none of the above cover. `request` is the
    /// decoded PDU payload (function code already consumed); write the
    /// response payload into `response_data`, returning how many bytes
    /// were written.
    fn custom_function(
        &mut self,
        code: u8,
        request_data: &[u8],
        response_data: &mut Packet,
    ) -> Result<(), ServerFault> {
        let _ = (code, request_data, response_data);
        Err(ServerFault::IllegalFunction)
    }
}

/// Standard Modbus serial line diagnostic counters (FC08 subcodes
/// 0x0B..0x0F), saturating rather than wrapping so a long-running device
/// doesn't silently roll a counter back to zero.
#[derive(Debug, Default)]
struct Diagnostics {
    bus_message_count: Cell<u16>,
    bus_comm_error_count: Cell<u16>,
    bus_exception_error_count: Cell<u16>,
    server_message_count: Cell<u16>,
    server_no_response_count: Cell<u16>,
}

impl Diagnostics {
    fn bump(counter: &Cell<u16>) {
        counter.set(counter.get().saturating_add(1));
    }

    fn clear(&self) {
        self.bus_message_count.set(0);
        self.bus_comm_error_count.set(0);
        self.bus_exception_error_count.set(0);
        self.server_message_count.set(0);
        self.server_no_response_count.set(0);
    }
}

/// A Modbus RTU server bound to one transport channel and one data model.
pub struct Server<'q, H: ServerHandler, S: SerialIo, T: TimerSource, const N: usize> {
    tp: TpContext<S, T>,
    handler: RefCell<H>,
    diagnostics: Diagnostics,
    events: &'q EventQueue<N>,
    handle: ChannelHandle,
}

impl<'q, H: ServerHandler, S: SerialIo, T: TimerSource, const N: usize> Server<'q, H, S, T, N> {
    pub fn new(
        tp: TpContext<S, T>,
        handler: H,
        events: &'q EventQueue<N>,
        handle: ChannelHandle,
    ) -> Self {
        Self {
            tp,
            handler: RefCell::new(handler),
            diagnostics: Diagnostics::default(),
            events,
            handle,
        }
    }

    pub fn bus_message_count(&self) -> u16 {
        self.diagnostics.bus_message_count.get()
    }
    pub fn bus_comm_error_count(&self) -> u16 {
        self.diagnostics.bus_comm_error_count.get()
    }
    pub fn bus_exception_error_count(&self) -> u16 {
        self.diagnostics.bus_exception_error_count.get()
    }
    pub fn server_message_count(&self) -> u16 {
        self.diagnostics.server_message_count.get()
    }
    pub fn server_no_response_count(&self) -> u16 {
        self.diagnostics.server_no_response_count.get()
    }

    fn handle_request(&self) {
        Diagnostics::bump(&self.diagnostics.bus_message_count);

        let request = self.tp.with_rx_packet(|pkt| pkt.clone());
        self.tp.reception_done();
        Diagnostics::bump(&self.diagnostics.server_message_count);

        let mut response = Packet::new(request.node(), request.code());
        let outcome = self.dispatch(&request, &mut response);

        match outcome {
            Ok(()) => {}
            Err(fault) => {
                Diagnostics::bump(&self.diagnostics.bus_exception_error_count);
                warn!(
                    "server: request {:#04x} from node {} faulted: {fault:?}",
                    request.code(),
                    request.node()
                );
                response.set_exception(request.code(), ExceptionCode::from(fault).into());
            }
        }

        if request.is_broadcast() {
            Diagnostics::bump(&self.diagnostics.server_no_response_count);
            return;
        }

        self.tp.with_tx_packet(|tx| *tx = response);
        if self.tp.transmit().is_err() {
            warn!("server: failed to transmit response, tx buffer full");
            Diagnostics::bump(&self.diagnostics.server_no_response_count);
        }
    }

    fn dispatch(&self, request: &Packet, response: &mut Packet) -> Result<(), ServerFault> {
        let mut handler = self.handler.borrow_mut();
        match FunctionCode::from(request.code()) {
            FunctionCode::ReadCoils => {
                self.read_bits(&mut *handler, request, response, true)
            }
            FunctionCode::ReadDiscreteInputs => {
                self.read_bits(&mut *handler, request, response, false)
            }
            FunctionCode::ReadHoldingRegisters => {
                self.read_registers(&mut *handler, request, response, true)
            }
            FunctionCode::ReadInputRegisters => {
                self.read_registers(&mut *handler, request, response, false)
            }
            FunctionCode::WriteSingleCoil => self.write_single_coil(&mut *handler, request, response),
            FunctionCode::WriteSingleRegister => {
                self.write_single_register(&mut *handler, request, response)
            }
            FunctionCode::WriteMultipleCoils => {
                self.write_multiple_coils(&mut *handler, request, response)
            }
            FunctionCode::WriteMultipleRegisters => {
                self.write_multiple_registers(&mut *handler, request, response)
            }
            FunctionCode::Diagnostics => self.diagnostics_request(request, response),
            FunctionCode::UserDefined(code) => {
                handler.custom_function(code, request.data(), response)
            }
        }
    }

    fn read_bits(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
        coils: bool,
    ) -> Result<(), ServerFault> {
        let start = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let quantity = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        if !(1..=2000).contains(&quantity) {
            return Err(ServerFault::IllegalDataValue);
        }
        let byte_count = packed_byte_count(quantity);
        let mut scratch = [0u8; 250];
        for i in 0..quantity {
            let address = start.wrapping_add(i);
            let bit = if coils {
                handler.read_coil(address)?
            } else {
                handler.read_discrete_input(address)?
            };
            if bit {
                scratch[(i / 8) as usize] |= 1 << (i % 8);
            }
        }
        let _ = response.push_u8(byte_count);
        let _ = response.extend_from_slice(&scratch[..byte_count as usize]);
        Ok(())
    }

    fn read_registers(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
        holding: bool,
    ) -> Result<(), ServerFault> {
        let start = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let quantity = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        if !(1..=125).contains(&quantity) {
            return Err(ServerFault::IllegalDataValue);
        }
        let _ = response.push_u8((quantity * 2) as u8);
        for i in 0..quantity {
            let address = start.wrapping_add(i);
            let value = if holding {
                handler.read_holding_register(address)?
            } else {
                handler.read_input_register(address)?
            };
            let _ = response.push_u16(value);
        }
        Ok(())
    }

    fn write_single_coil(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
    ) -> Result<(), ServerFault> {
        let address = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let raw = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        let value = match raw {
            0x0000 => false,
            0xFF00 => true,
            _ => return Err(ServerFault::IllegalDataValue),
        };
        handler.write_coil(address, value)?;
        let _ = response.push_u16(address);
        let _ = response.push_u16(raw);
        Ok(())
    }

    fn write_single_register(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
    ) -> Result<(), ServerFault> {
        let address = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let value = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        handler.write_holding_register(address, value)?;
        let _ = response.push_u16(address);
        let _ = response.push_u16(value);
        Ok(())
    }

    fn write_multiple_coils(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
    ) -> Result<(), ServerFault> {
        let start = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let quantity = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        let byte_count = request.get_u8(4).ok_or(ServerFault::IllegalDataAddress)?;
        if !(1..=1968).contains(&quantity) || byte_count != packed_byte_count(quantity) {
            return Err(ServerFault::IllegalDataValue);
        }
        let payload = request
            .data()
            .get(5..5 + byte_count as usize)
            .ok_or(ServerFault::IllegalDataValue)?;
        for (i, bit) in BitSet::new(payload).take(quantity as usize).enumerate() {
            handler.write_coil(start.wrapping_add(i as u16), bit)?;
        }
        let _ = response.push_u16(start);
        let _ = response.push_u16(quantity);
        Ok(())
    }

    fn write_multiple_registers(
        &self,
        handler: &mut H,
        request: &Packet,
        response: &mut Packet,
    ) -> Result<(), ServerFault> {
        let start = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let quantity = request.get_u16(2).ok_or(ServerFault::IllegalDataAddress)?;
        let byte_count = request.get_u8(4).ok_or(ServerFault::IllegalDataAddress)?;
        if !(1..=123).contains(&quantity) || byte_count != (quantity * 2) as u8 {
            return Err(ServerFault::IllegalDataValue);
        }
        let payload = request
            .data()
            .get(5..5 + byte_count as usize)
            .ok_or(ServerFault::IllegalDataValue)?;
        for (i, value) in RegisterIter::new(payload).take(quantity as usize).enumerate() {
            handler.write_holding_register(start.wrapping_add(i as u16), value)?;
        }
        let _ = response.push_u16(start);
        let _ = response.push_u16(quantity);
        Ok(())
    }

    fn diagnostics_request(&self, request: &Packet, response: &mut Packet) -> Result<(), ServerFault> {
        let subcode = request.get_u16(0).ok_or(ServerFault::IllegalDataAddress)?;
        let data = request.get_u16(2).unwrap_or(0);
        let subcode =
            DiagnosticsSubcode::from_u16(subcode).ok_or(ServerFault::IllegalFunction)?;
        let reply = match subcode {
            DiagnosticsSubcode::ReturnQueryData => data,
            DiagnosticsSubcode::ClearCounters => {
                debug!("server: clearing diagnostic counters");
                self.diagnostics.clear();
                data
            }
            DiagnosticsSubcode::ReturnBusMessageCount => self.bus_message_count(),
            DiagnosticsSubcode::ReturnBusCommErrorCount => self.bus_comm_error_count(),
            DiagnosticsSubcode::ReturnBusExceptionErrorCount => self.bus_exception_error_count(),
            DiagnosticsSubcode::ReturnServerMessageCount => self.server_message_count(),
            DiagnosticsSubcode::ReturnServerNoResponseCount => self.server_no_response_count(),
        };
        let _ = response.push_u16(subcode.code());
        let _ = response.push_u16(reply);
        Ok(())
    }
}

impl<H: ServerHandler, S: SerialIo, T: TimerSource, const N: usize> Server<'_, H, S, T, N> {
    fn note_tp_event(&self, event: crate::tp::TpEvent) {
        match event {
            crate::tp::TpEvent::FrameReady => {
                let _ = self.events.post(Event {
                    id: EventId::FrameReceived,
                    channel: self.handle,
                });
            }
            crate::tp::TpEvent::FrameDropped(reason) => {
                use crate::rtu::DropReason;
                match reason {
                    DropReason::CrcMismatch
                    | DropReason::BufferOverflow
                    | DropReason::FrameTooShort
                    | DropReason::InterCharacterViolation => {
                        Diagnostics::bump(&self.diagnostics.bus_comm_error_count);
                    }
                    DropReason::AddressMismatch => {}
                }
            }
            crate::tp::TpEvent::TransmitComplete | crate::tp::TpEvent::None => {}
        }
    }
}

impl<H: ServerHandler, S: SerialIo, T: TimerSource, const N: usize> ChannelProcessor
    for Server<'_, H, S, T, N>
{
    fn process_event(&self, id: EventId) {
        if id == EventId::FrameReceived {
            self.handle_request();
        }
    }

    fn on_bytes_received(&self, bytes: &[u8], now: u16) {
        let event = self.tp.on_bytes_received(bytes, now);
        self.note_tp_event(event);
    }

    fn on_transmit_complete(&self, _now: u16) {
        self.tp.on_transmit_complete();
    }

    fn poll(&self, now: u16) {
        let event = self.tp.poll(now);
        self.note_tp_event(event);
    }
}
