//! # Modbus Protocol Definitions
//!
//! Typed function codes, exception codes, and the request/response pair a
//! master transaction exchanges with a slave.
//!
//! ## Request layout per function code
//!
//! | Function | `quantity` | `data` |
//! |----------|------------|--------|
//! | 0x01-0x04 | items to read | empty |
//! | 0x05 | 1 | coil wire value, 2 bytes (`FF 00` / `00 00`) |
//! | 0x06 | 1 | register value, 2 bytes big-endian |
//! | 0x0F | coil count | packed coil bits, LSB first |
//! | 0x10 | register count | register values, big-endian |
//!
//! The byte-count field of 0x0F/0x10 is added when the PDU is built.

use std::fmt;

use crate::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_ACKNOWLEDGE, EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    EXCEPTION_GATEWAY_TARGET_FAILED, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_MEMORY_PARITY_ERROR, EXCEPTION_SERVER_DEVICE_BUSY,
    EXCEPTION_SERVER_DEVICE_FAILURE, FC_READ_COILS, FC_READ_DISCRETE_INPUTS,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_SLAVE_ADDRESS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
    MIN_SLAVE_ADDRESS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};

/// Slave (unit) address on the serial line
pub type SlaveId = u8;

// ============================================================================
// Function codes
// ============================================================================

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = FC_READ_COILS,
    ReadDiscreteInputs = FC_READ_DISCRETE_INPUTS,
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    ReadInputRegisters = FC_READ_INPUT_REGISTERS,
    WriteSingleCoil = FC_WRITE_SINGLE_COIL,
    WriteSingleRegister = FC_WRITE_SINGLE_REGISTER,
    WriteMultipleCoils = FC_WRITE_MULTIPLE_COILS,
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl ModbusFunction {
    /// Convert a raw function code; the exception bit must be cleared first
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code {
            FC_READ_COILS => Ok(ModbusFunction::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(ModbusFunction::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(ModbusFunction::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(ModbusFunction::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(ModbusFunction::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(ModbusFunction::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(ModbusFunction::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(code)),
        }
    }

    /// Raw function code
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Read functions (0x01-0x04)
    pub fn is_read(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Write functions (0x05, 0x06, 0x0F, 0x10)
    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// Functions addressing single-bit tables
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }

    /// Largest quantity one request may carry
    pub fn max_quantity(self) -> u16 {
        let max = match self {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
        };
        max as u16
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        ModbusPdu::function_code_description(self.to_u8())
    }
}

impl TryFrom<u8> for ModbusFunction {
    type Error = ModbusError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_u8(code)
    }
}

impl From<ModbusFunction> for u8 {
    fn from(function: ModbusFunction) -> Self {
        function.to_u8()
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.name())
    }
}

// ============================================================================
// Exception codes
// ============================================================================

/// Modbus exception codes a slave may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = EXCEPTION_ILLEGAL_FUNCTION,
    IllegalDataAddress = EXCEPTION_ILLEGAL_DATA_ADDRESS,
    IllegalDataValue = EXCEPTION_ILLEGAL_DATA_VALUE,
    ServerDeviceFailure = EXCEPTION_SERVER_DEVICE_FAILURE,
    Acknowledge = EXCEPTION_ACKNOWLEDGE,
    ServerDeviceBusy = EXCEPTION_SERVER_DEVICE_BUSY,
    MemoryParityError = EXCEPTION_MEMORY_PARITY_ERROR,
    GatewayPathUnavailable = EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    GatewayTargetFailed = EXCEPTION_GATEWAY_TARGET_FAILED,
}

impl ModbusException {
    /// Convert a raw exception code
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Some(ModbusException::IllegalFunction),
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Some(ModbusException::IllegalDataAddress),
            EXCEPTION_ILLEGAL_DATA_VALUE => Some(ModbusException::IllegalDataValue),
            EXCEPTION_SERVER_DEVICE_FAILURE => Some(ModbusException::ServerDeviceFailure),
            EXCEPTION_ACKNOWLEDGE => Some(ModbusException::Acknowledge),
            EXCEPTION_SERVER_DEVICE_BUSY => Some(ModbusException::ServerDeviceBusy),
            EXCEPTION_MEMORY_PARITY_ERROR => Some(ModbusException::MemoryParityError),
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Some(ModbusException::GatewayPathUnavailable),
            EXCEPTION_GATEWAY_TARGET_FAILED => Some(ModbusException::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Raw exception code
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Exception a slave sends back when servicing a request fails
impl From<&ModbusError> for ModbusException {
    fn from(err: &ModbusError) -> Self {
        match err {
            ModbusError::InvalidFunction { .. } => ModbusException::IllegalFunction,
            ModbusError::OutOfRange { .. }
            | ModbusError::UnknownBlock { .. }
            | ModbusError::AddressNotMapped { .. } => ModbusException::IllegalDataAddress,
            ModbusError::InvalidData { .. } => ModbusException::IllegalDataValue,
            ModbusError::Exception { code, .. } => {
                ModbusException::from_u8(*code).unwrap_or(ModbusException::ServerDeviceFailure)
            }
            _ => ModbusException::ServerDeviceFailure,
        }
    }
}

// ============================================================================
// Transaction lifecycle
// ============================================================================

/// Lifecycle of one master transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Request built, not yet on the wire
    Created,
    /// Request bytes written
    Sent,
    /// Collecting response bytes
    AwaitingResponse,
    /// Matching response decoded
    Completed,
    /// Timed out, rejected, or answered with an exception
    Failed,
}

impl TransactionState {
    /// Terminal states
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request addressed to one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Read request (0x01-0x04)
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Write single coil (0x05)
    pub fn new_write_coil(slave_id: SlaveId, address: u16, value: bool) -> Self {
        let wire = if value { COIL_ON } else { COIL_OFF };
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: wire.to_be_bytes().to_vec(),
        }
    }

    /// Write single register (0x06)
    pub fn new_write_register(slave_id: SlaveId, address: u16, value: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Write multiple coils (0x0F)
    pub fn new_write_coils(slave_id: SlaveId, address: u16, values: &[bool]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: pack_bits(values),
        }
    }

    /// Write multiple registers (0x10)
    pub fn new_write_registers(slave_id: SlaveId, address: u16, values: &[u16]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 2);
        for &value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data,
        }
    }

    /// Value carried by a single write (0x05/0x06)
    pub fn single_value(&self) -> Option<u16> {
        match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister
                if self.data.len() == 2 =>
            {
                Some(u16::from_be_bytes([self.data[0], self.data[1]]))
            }
            _ => None,
        }
    }

    /// Register values carried by 0x10
    pub fn register_values(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Coil values carried by 0x0F
    pub fn coil_values(&self) -> Vec<bool> {
        unpack_bits(&self.data, self.quantity as usize)
    }

    /// Check address, quantity and payload consistency
    pub fn validate(&self) -> ModbusResult<()> {
        if !(MIN_SLAVE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(&self.slave_id) {
            return Err(ModbusError::invalid_data(format!(
                "Slave address {} outside {}..={}",
                self.slave_id, MIN_SLAVE_ADDRESS, MAX_SLAVE_ADDRESS
            )));
        }

        let max = self.function.max_quantity();
        if self.quantity == 0 || self.quantity > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity {} for {} (1..={})",
                self.quantity, self.function, max
            )));
        }

        if (self.address as u32) + (self.quantity as u32) > 0x1_0000 {
            return Err(ModbusError::invalid_data(format!(
                "Address range {}+{} exceeds 65535",
                self.address, self.quantity
            )));
        }

        let expected_data = match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => 0,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 2,
            ModbusFunction::WriteMultipleCoils => (self.quantity as usize).div_ceil(8),
            ModbusFunction::WriteMultipleRegisters => self.quantity as usize * 2,
        };
        if self.data.len() != expected_data {
            return Err(ModbusError::invalid_data(format!(
                "{} expects {} data bytes, got {}",
                self.function,
                expected_data,
                self.data.len()
            )));
        }

        if self.function == ModbusFunction::WriteSingleCoil {
            let value = self.single_value().unwrap_or(COIL_OFF);
            if value != COIL_ON && value != COIL_OFF {
                return Err(ModbusError::invalid_data(format!(
                    "Coil value 0x{:04X} must be 0xFF00 or 0x0000",
                    value
                )));
            }
        }

        Ok(())
    }

    /// Build the request PDU
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        let fc = self.function.to_u8();
        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                PduBuilder::build_read_request(fc, self.address, self.quantity)
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                let value = self.single_value().ok_or_else(|| {
                    ModbusError::invalid_data(format!("{} requires a 2-byte value", self.function))
                })?;
                Ok(PduBuilder::new()
                    .function_code(fc)?
                    .address(self.address)?
                    .quantity(value)?
                    .build())
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                Ok(PduBuilder::new()
                    .function_code(fc)?
                    .address(self.address)?
                    .quantity(self.quantity)?
                    .byte(self.data.len() as u8)?
                    .data(&self.data)?
                    .build())
            }
        }
    }

    /// Parse a request PDU received by a slave.
    ///
    /// Unknown function codes yield `InvalidFunction`; truncated bodies or a
    /// byte count that disagrees with the quantity yield `InvalidData`.
    pub fn from_pdu(slave_id: SlaveId, pdu: &[u8]) -> ModbusResult<Self> {
        let (&fc, body) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty request PDU"))?;
        let function = ModbusFunction::from_u8(fc)?;

        if body.len() < 4 {
            return Err(ModbusError::invalid_data(format!(
                "{} request body too short: {} bytes",
                function,
                body.len()
            )));
        }
        let address = u16::from_be_bytes([body[0], body[1]]);
        let word = u16::from_be_bytes([body[2], body[3]]);

        let request = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => Self::new_read(slave_id, function, address, word),
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => Self {
                slave_id,
                function,
                address,
                quantity: 1,
                data: body[2..4].to_vec(),
            },
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                let byte_count = *body.get(4).ok_or_else(|| {
                    ModbusError::invalid_data(format!("{} missing byte count", function))
                })? as usize;
                let data = body.get(5..5 + byte_count).ok_or_else(|| {
                    ModbusError::invalid_data(format!(
                        "{} declares {} bytes, {} present",
                        function,
                        byte_count,
                        body.len().saturating_sub(5)
                    ))
                })?;
                Self {
                    slave_id,
                    function,
                    address,
                    quantity: word,
                    data: data.to_vec(),
                }
            }
        };

        Ok(request)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A decoded response from one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    /// PDU bytes after the function code
    data: Vec<u8>,
    exception: Option<u8>,
}

impl ModbusResponse {
    /// Normal response
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    /// Exception response
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: vec![code],
            exception: Some(code),
        }
    }

    /// Build from the parts of a decoded frame
    pub fn from_parts(slave_id: SlaveId, function_code: u8, payload: &[u8]) -> ModbusResult<Self> {
        let function = ModbusFunction::from_u8(function_code & 0x7F)?;
        if function_code & 0x80 != 0 {
            let code = *payload
                .first()
                .ok_or_else(|| ModbusError::frame("Exception response without code"))?;
            Ok(Self::new_exception(slave_id, function, code))
        } else {
            Ok(Self::new_success(slave_id, function, payload.to_vec()))
        }
    }

    /// Payload after the function code
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Exception carried by this response, as an error
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception
            .map(|code| ModbusError::exception(self.function.to_u8(), code))
    }

    /// Function code as it appears on the wire
    pub fn wire_function_code(&self) -> u8 {
        match self.exception {
            Some(_) => self.function.to_u8() | 0x80,
            None => self.function.to_u8(),
        }
    }

    /// Response PDU (function code + payload)
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(self.wire_function_code())?
            .data(&self.data)?
            .build())
    }

    /// Register values of a 0x03/0x04 response
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.counted_payload()?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::protocol(format!(
                "Register payload has odd length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Bit values of a 0x01/0x02 response, padded to whole bytes
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let payload = self.counted_payload()?;
        Ok(unpack_bits(payload, payload.len() * 8))
    }

    /// Echoed (address, value-or-quantity) of a write response
    pub fn parse_write_echo(&self) -> ModbusResult<(u16, u16)> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }
        if self.data.len() != 4 {
            return Err(ModbusError::protocol(format!(
                "Write echo must be 4 bytes, got {}",
                self.data.len()
            )));
        }
        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }

    fn counted_payload(&self) -> ModbusResult<&[u8]> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }
        let (&byte_count, rest) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::protocol("Empty read response"))?;
        if rest.len() != byte_count as usize {
            return Err(ModbusError::protocol(format!(
                "Byte count {} does not match payload length {}",
                byte_count,
                rest.len()
            )));
        }
        Ok(rest)
    }
}

// ============================================================================
// Bit packing
// ============================================================================

/// Pack booleans LSB-first into bytes
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack up to `count` LSB-first bits
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(bytes.len() * 8))
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_round_trip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            let function = ModbusFunction::from_u8(code).unwrap();
            assert_eq!(function.to_u8(), code);
        }
        assert_eq!(
            ModbusFunction::from_u8(0x2B),
            Err(ModbusError::InvalidFunction { code: 0x2B })
        );
        assert!(ModbusFunction::try_from(0x83).is_err());
    }

    #[test]
    fn test_read_request_pdu() {
        let request = ModbusRequest::new_read(0x11, ModbusFunction::ReadHoldingRegisters, 0x006B, 3);
        request.validate().unwrap();
        assert_eq!(request.to_pdu().unwrap().as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_write_coil_request_encodes_wire_value() {
        let on = ModbusRequest::new_write_coil(1, 0, true);
        assert_eq!(on.to_pdu().unwrap().as_slice(), &[0x05, 0x00, 0x00, 0xFF, 0x00]);

        let off = ModbusRequest::new_write_coil(1, 0, false);
        assert_eq!(off.to_pdu().unwrap().as_slice(), &[0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let broadcast = ModbusRequest::new_read(0, ModbusFunction::ReadCoils, 0, 1);
        assert!(broadcast.validate().is_err());

        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, 126);
        assert!(too_many.validate().is_err());

        let zero = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 0);
        assert!(zero.validate().is_err());

        let wrap = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0xFFFF, 2);
        assert!(wrap.validate().is_err());

        let mut bad_coil = ModbusRequest::new_write_coil(1, 0, true);
        bad_coil.data = vec![0x12, 0x34];
        assert!(matches!(
            bad_coil.validate(),
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_from_pdu_multiple_registers() {
        let request = ModbusRequest::new_write_registers(2, 1, &[0x000A, 0x0102]);
        let pdu = request.to_pdu().unwrap();
        let parsed = ModbusRequest::from_pdu(2, pdu.as_slice()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.register_values(), vec![0x000A, 0x0102]);
    }

    #[test]
    fn test_from_pdu_truncated() {
        assert!(matches!(
            ModbusRequest::from_pdu(1, &[0x03, 0x00]),
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(matches!(
            ModbusRequest::from_pdu(1, &[0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00]),
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(matches!(
            ModbusRequest::from_pdu(1, &[0x2B, 0x0E, 0x01, 0x00, 0x00]),
            Err(ModbusError::InvalidFunction { code: 0x2B })
        ));
    }

    #[test]
    fn test_response_parse_registers() {
        let response = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            vec![0x06, 0x00, 0x07, 0x00, 0x01, 0x00, 0x05],
        );
        assert_eq!(response.parse_registers().unwrap(), vec![7, 1, 5]);

        let short = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            vec![0x04, 0x00, 0x07],
        );
        assert!(matches!(
            short.parse_registers(),
            Err(ModbusError::Protocol { .. })
        ));
    }

    #[test]
    fn test_response_exception() {
        let response = ModbusResponse::from_parts(1, 0x84, &[0x02]).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.function, ModbusFunction::ReadInputRegisters);
        assert_eq!(response.wire_function_code(), 0x84);
        let err = response.parse_registers().unwrap_err();
        assert_eq!(err.exception_code(), Some(0x02));
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits.to_vec());
    }

    #[test]
    fn test_exception_from_error() {
        let err = ModbusError::OutOfRange {
            block: "test".into(),
            offset: 0,
            count: 20,
            length: 10,
        };
        assert_eq!(ModbusException::from(&err), ModbusException::IllegalDataAddress);
        assert_eq!(
            ModbusException::from(&ModbusError::invalid_function(0x2B)),
            ModbusException::IllegalFunction
        );
        assert_eq!(
            ModbusException::from(&ModbusError::invalid_data("coil")),
            ModbusException::IllegalDataValue
        );
    }
}
