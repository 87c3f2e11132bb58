//! Modbus function codes and exception codes (spec.md §4.4, §6, GLOSSARY).

use core::fmt;

/// A public Modbus function code this crate gives first-class dispatch to.
/// Anything else is a [`FunctionCode::UserDefined`] code routed through the
/// server's custom-function hook (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    Diagnostics,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    UserDefined(u8),
}

impl FunctionCode {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const DIAGNOSTICS: u8 = 0x08;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

    /// Bit OR'd into a request's function code to flag an exception response.
    pub const EXCEPTION_MASK: u8 = 0x80;

    pub fn code(self) -> u8 {
        match self {
            Self::ReadCoils => Self::READ_COILS,
            Self::ReadDiscreteInputs => Self::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => Self::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => Self::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => Self::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => Self::WRITE_SINGLE_REGISTER,
            Self::Diagnostics => Self::DIAGNOSTICS,
            Self::WriteMultipleCoils => Self::WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => Self::WRITE_MULTIPLE_REGISTERS,
            Self::UserDefined(code) => code,
        }
    }
}

impl From<u8> for FunctionCode {
    fn from(value: u8) -> Self {
        // The MSB flags an exception response; callers that need to
        // distinguish should check it before converting.
        match value & !FunctionCode::EXCEPTION_MASK {
            Self::READ_COILS => Self::ReadCoils,
            Self::READ_DISCRETE_INPUTS => Self::ReadDiscreteInputs,
            Self::READ_HOLDING_REGISTERS => Self::ReadHoldingRegisters,
            Self::READ_INPUT_REGISTERS => Self::ReadInputRegisters,
            Self::WRITE_SINGLE_COIL => Self::WriteSingleCoil,
            Self::WRITE_SINGLE_REGISTER => Self::WriteSingleRegister,
            Self::DIAGNOSTICS => Self::Diagnostics,
            Self::WRITE_MULTIPLE_COILS => Self::WriteMultipleCoils,
            Self::WRITE_MULTIPLE_REGISTERS => Self::WriteMultipleRegisters,
            other => Self::UserDefined(other),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(value: FunctionCode) -> Self {
        value.code()
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.code())
    }
}

/// Modbus exception codes (spec.md §4.4).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl From<ExceptionCode> for u8 {
    fn from(value: ExceptionCode) -> Self {
        value as u8
    }
}

/// Diagnostics (FC08) sub-function codes this server implements
/// (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsSubcode {
    ReturnQueryData,
    ClearCounters,
    ReturnBusMessageCount,
    ReturnBusCommErrorCount,
    ReturnBusExceptionErrorCount,
    ReturnServerMessageCount,
    ReturnServerNoResponseCount,
}

impl DiagnosticsSubcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::ReturnQueryData),
            0x000A => Some(Self::ClearCounters),
            0x000B => Some(Self::ReturnBusMessageCount),
            0x000C => Some(Self::ReturnBusCommErrorCount),
            0x000D => Some(Self::ReturnBusExceptionErrorCount),
            0x000E => Some(Self::ReturnServerMessageCount),
            0x000F => Some(Self::ReturnServerNoResponseCount),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::ReturnQueryData => 0x0000,
            Self::ClearCounters => 0x000A,
            Self::ReturnBusMessageCount => 0x000B,
            Self::ReturnBusCommErrorCount => 0x000C,
            Self::ReturnBusExceptionErrorCount => 0x000D,
            Self::ReturnServerMessageCount => 0x000E,
            Self::ReturnServerNoResponseCount => 0x000F,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_masks_exception_bit() {
        assert_eq!(FunctionCode::from(0x03), FunctionCode::ReadHoldingRegisters);
        assert_eq!(FunctionCode::from(0x83), FunctionCode::ReadHoldingRegisters);
    }

    #[test]
    fn unknown_code_is_user_defined() {
        assert_eq!(FunctionCode::from(0x41), FunctionCode::UserDefined(0x41));
    }

    #[test]
    fn diagnostics_subcode_round_trip() {
        assert_eq!(
            DiagnosticsSubcode::from_u16(0x000B),
            Some(DiagnosticsSubcode::ReturnBusMessageCount)
        );
        assert_eq!(DiagnosticsSubcode::from_u16(0x1234), None);
    }
}
