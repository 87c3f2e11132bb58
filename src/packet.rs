//! Fixed-capacity ADU container (spec.md §3: "Packet").
//!
//! A `Packet` holds one ADU's worth of bytes: `node`, `code` and `data`,
//! exactly as spec.md describes. The slave address and CRC only ever exist
//! on the wire; this type is the transport-independent view the rest of the
//! stack (RFE's decode step, SRV, CLI) actually works with.

use core::fmt;

use heapless::Vec;

use crate::error::BufferError;
use crate::PDU_MAX_LEN;

type DataVec = Vec<u8, { PDU_MAX_LEN - 1 }>;

/// One Modbus ADU: slave address, function code, and payload.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet {
    node: u8,
    code: u8,
    data: DataVec,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("node", &self.node)
            .field("code", &self.code)
            .field("data", &self.data.as_slice())
            .finish()
    }
}

impl Packet {
    /// Broadcast node address.
    pub const BROADCAST: u8 = 0;

    pub fn new(node: u8, code: u8) -> Self {
        Self {
            node,
            code,
            data: DataVec::new(),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn set_node(&mut self, node: u8) {
        self.node = node;
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn set_code(&mut self, code: u8) {
        self.code = code;
    }

    pub fn is_broadcast(&self) -> bool {
        self.node == Self::BROADCAST
    }

    /// Sets `code` to `code | 0x80` and the single exception byte, per
    /// spec.md §4.4's exception encoding rule.
    pub fn set_exception(&mut self, request_code: u8, exception: u8) {
        self.code = request_code | 0x80;
        self.data.clear();
        // Capacity (PDU_MAX_LEN - 1) is always > 0, push cannot fail.
        let _ = self.data.push(exception);
    }

    pub fn is_exception(&self) -> bool {
        self.code & 0x80 != 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.node = 0;
        self.code = 0;
        self.data.clear();
    }

    pub fn push_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.data.push(value).map_err(|_| BufferError::NoSpaceLeft)
    }

    pub fn push_u16(&mut self, value: u16) -> Result<(), BufferError> {
        self.push_u8((value >> 8) as u8)?;
        self.push_u8(value as u8)
    }

    pub fn extend_from_slice(&mut self, buf: &[u8]) -> Result<(), BufferError> {
        self.data
            .extend_from_slice(buf)
            .map_err(|_| BufferError::NoSpaceLeft)
    }

    pub fn get_u8(&self, index: usize) -> Option<u8> {
        self.data.get(index).copied()
    }

    pub fn get_u16(&self, index: usize) -> Option<u16> {
        let high = self.get_u8(index)?;
        let low = self.get_u8(index + 1)?;
        Some(u16::from_be_bytes([high, low]))
    }

    /// Rebuilds this packet's `node`/`code`/`data` from an already
    /// CRC-checked RTU ADU payload: `[node][code][data...]` (CRC stripped).
    pub fn load_from_adu_payload(&mut self, payload: &[u8]) -> Result<(), BufferError> {
        if payload.is_empty() {
            return Err(BufferError::OutOfBounds);
        }
        self.node = payload[0];
        self.code = *payload.get(1).unwrap_or(&0);
        self.data.clear();
        if payload.len() > 2 {
            self.extend_from_slice(&payload[2..])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packet_has_no_data() {
        let pkt = Packet::new(10, 3);
        assert_eq!(pkt.node(), 10);
        assert_eq!(pkt.code(), 3);
        assert_eq!(pkt.data(), &[]);
    }

    #[test]
    fn push_u16_is_big_endian() {
        let mut pkt = Packet::new(1, 3);
        pkt.push_u16(0x789A).unwrap();
        assert_eq!(pkt.data(), &[0x78, 0x9A]);
        assert_eq!(pkt.get_u16(0), Some(0x789A));
    }

    #[test]
    fn set_exception_sets_high_bit_and_single_byte() {
        let mut pkt = Packet::new(1, 0x03);
        pkt.set_exception(0x03, 0x02);
        assert_eq!(pkt.code(), 0x83);
        assert!(pkt.is_exception());
        assert_eq!(pkt.data(), &[0x02]);
    }

    #[test]
    fn broadcast_node_is_zero() {
        let mut pkt = Packet::new(0, 6);
        assert!(pkt.is_broadcast());
        pkt.set_node(1);
        assert!(!pkt.is_broadcast());
    }

    #[test]
    fn load_from_adu_payload_round_trips() {
        let mut pkt = Packet::new(0, 0);
        pkt.load_from_adu_payload(&[10, 0x03, 0x9C, 0x40, 0x00, 0x02]).unwrap();
        assert_eq!(pkt.node(), 10);
        assert_eq!(pkt.code(), 0x03);
        assert_eq!(pkt.data(), &[0x9C, 0x40, 0x00, 0x02]);
    }
}
