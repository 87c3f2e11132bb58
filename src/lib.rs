#![cfg_attr(not(feature = "std"), no_std)]

//! Core of an embedded Modbus RTU client/server stack.
//!
//! This crate implements the wire-protocol engine (frame delimitation,
//! CRC-16, timing), the transport-layer state machine, the server
//! function-code dispatcher and the client request/response orchestrator.
//! Serial byte I/O and the free-running timer are external collaborators,
//! modeled here as the [`sio::SerialIo`] and [`timer::TimerSource`] traits.

pub mod bits;
pub mod client;
pub mod crc;
pub mod error;
pub mod event;
pub mod function;
pub mod osal;
pub mod packet;
pub mod registry;
pub mod rtu;
pub mod server;
pub mod sio;
pub mod timer;
pub mod timing;
pub mod tp;

/// Maximum PDU length: function code (1 byte) + payload (up to 252 bytes).
pub const PDU_MAX_LEN: usize = 253;

/// Maximum ADU length: slave address (1) + PDU (253) + CRC (2).
pub const ADU_MAX_LEN: usize = 256;
