//! Stack-allocated Modbus PDU and builders
//!
//! The PDU is the function code plus its body; the RTU codec wraps it with
//! the slave address and CRC. Masters use the request builders, the slave
//! engine uses the response and exception builders.

use tracing::trace;

use crate::constants::{EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{pack_bits, ModbusFunction};

/// PDU backed by a fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    /// Extend with a byte slice
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte), exception bit included
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Body after the function code
    #[inline]
    pub fn body(&self) -> &[u8] {
        self.as_slice().get(1..).unwrap_or(&[])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.body().first().copied()
        } else {
            None
        }
    }

    /// Human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    /// Add a quantity or a single value
    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            trace!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    // ========================================================================
    // Requests (master side)
    // ========================================================================

    /// Read request for FC01-04
    pub fn build_read_request(
        fc: u8,
        start_address: u16,
        quantity: u16,
    ) -> ModbusResult<ModbusPdu> {
        if !matches!(fc, 0x01..=0x04) {
            return Err(ModbusError::invalid_function(fc));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    // ========================================================================
    // Responses (slave side)
    // ========================================================================

    /// Response to FC03/FC04
    pub fn build_read_registers_response(
        function: ModbusFunction,
        values: &[u16],
    ) -> ModbusResult<ModbusPdu> {
        let mut builder = PduBuilder::new()
            .function_code(function.to_u8())?
            .byte((values.len() * 2) as u8)?;
        for &value in values {
            builder = builder.quantity(value)?;
        }
        Ok(builder.build())
    }

    /// Response to FC01/FC02, bits packed LSB first
    pub fn build_read_bits_response(
        function: ModbusFunction,
        values: &[bool],
    ) -> ModbusResult<ModbusPdu> {
        let packed = pack_bits(values);
        Ok(PduBuilder::new()
            .function_code(function.to_u8())?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    /// Echo for FC05/06 (address, value) and FC0F/10 (address, quantity)
    pub fn build_write_response(
        function: ModbusFunction,
        address: u16,
        value_or_quantity: u16,
    ) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(function.to_u8())?
            .address(address)?
            .quantity(value_or_quantity)?
            .build())
    }

    /// Exception response: function code with the high bit set, then the code
    pub fn build_exception(fc: u8, exception_code: u8) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc | EXCEPTION_FLAG)?
            .byte(exception_code)?
            .build())
    }
}
