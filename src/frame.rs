//! # RTU Frame Codec
//!
//! An RTU frame is the slave address, the PDU, and a CRC-16/Modbus trailer
//! sent low byte first:
//!
//! ```text
//! +---------+----------+-----------------+---------+---------+
//! | address | function | payload (0..252) | CRC lo  | CRC hi  |
//! +---------+----------+-----------------+---------+---------+
//! ```
//!
//! RTU has no length field, so a receiver has to know how long a frame is
//! from its first bytes. [`request_frame_len`] and [`response_frame_len`]
//! answer that for every supported function code; anything else falls back
//! to the 3.5 character silent interval.

use std::fmt;

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{CRC_LEN, EXCEPTION_FLAG, MAX_RTU_FRAME_SIZE, MIN_RTU_FRAME_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};

/// CRC calculator for RTU (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/Modbus over `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Format raw bytes as a hex string for packet logging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A decoded RTU frame with a verified checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub address: SlaveId,
    /// Raw function code, exception bit included
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl RtuFrame {
    pub fn new(address: SlaveId, function_code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            function_code,
            payload: payload.into(),
        }
    }

    /// Frame carrying a PDU
    pub fn from_pdu(address: SlaveId, pdu: &ModbusPdu) -> ModbusResult<Self> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;
        Ok(Self::new(address, fc, pdu.body()))
    }

    /// Frame for a master request
    pub fn from_request(request: &ModbusRequest) -> ModbusResult<Self> {
        Self::from_pdu(request.slave_id, &request.to_pdu()?)
    }

    /// Frame for a slave response
    pub fn from_response(response: &ModbusResponse) -> ModbusResult<Self> {
        Self::from_pdu(response.slave_id, &response.to_pdu()?)
    }

    /// Exception response frames have the high bit of the function code set
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code of an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Serialize with CRC trailer
    pub fn encode(&self) -> Vec<u8> {
        encode(self.address, self.function_code, &self.payload)
    }
}

impl fmt::Display for RtuFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr={} fc=0x{:02X} payload=[{}]",
            self.address,
            self.function_code,
            format_hex(&self.payload)
        )
    }
}

/// Encode address + function code + payload and append the CRC (LE)
pub fn encode(address: SlaveId, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + payload.len() + CRC_LEN);
    frame.push(address);
    frame.push(function_code);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Decode a complete frame.
///
/// Fails with `Frame { Malformed }` below the minimum length or above the
/// RTU maximum, and `Frame { CrcMismatch }` when the trailer is wrong.
pub fn decode(bytes: &[u8]) -> ModbusResult<RtuFrame> {
    if bytes.len() < MIN_RTU_FRAME_LEN {
        return Err(ModbusError::frame(format!(
            "Frame too short: {} bytes (min {})",
            bytes.len(),
            MIN_RTU_FRAME_LEN
        )));
    }
    if bytes.len() > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::frame(format!(
            "Frame too long: {} bytes (max {})",
            bytes.len(),
            MAX_RTU_FRAME_SIZE
        )));
    }

    let body_len = bytes.len() - CRC_LEN;
    let (body, trailer) = bytes.split_at(body_len);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(ModbusError::crc_mismatch(calculated, received));
    }

    Ok(RtuFrame {
        address: body[0],
        function_code: body[1],
        payload: body[2..].to_vec(),
    })
}

// ============================================================================
// Stream framing
// ============================================================================

/// Expected total length of a frame, judged from its leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// More bytes are needed before the length is known
    Incomplete,
    /// Total frame length including CRC
    Known(usize),
    /// Function code with no known layout; wait for the silent interval
    Indeterminate,
}

/// Length of a request frame as seen by a slave
pub fn request_frame_len(buf: &[u8]) -> FrameLen {
    let Some(&fc) = buf.get(1) else {
        return FrameLen::Incomplete;
    };
    match fc {
        0x01..=0x06 => FrameLen::Known(8),
        0x0F | 0x10 => match buf.get(6) {
            Some(&byte_count) => FrameLen::Known(7 + byte_count as usize + CRC_LEN),
            None => FrameLen::Incomplete,
        },
        _ => FrameLen::Indeterminate,
    }
}

/// Length of a response frame as seen by a master
pub fn response_frame_len(buf: &[u8]) -> FrameLen {
    let Some(&fc) = buf.get(1) else {
        return FrameLen::Incomplete;
    };
    if fc & EXCEPTION_FLAG != 0 {
        return FrameLen::Known(5);
    }
    match fc {
        0x01..=0x04 => match buf.get(2) {
            Some(&byte_count) => FrameLen::Known(3 + byte_count as usize + CRC_LEN),
            None => FrameLen::Incomplete,
        },
        0x05 | 0x06 | 0x0F | 0x10 => FrameLen::Known(8),
        _ => FrameLen::Indeterminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameErrorKind;

    fn hex(s: &str) -> Vec<u8> {
        s.split_whitespace()
            .map(|b| u8::from_str_radix(b, 16).unwrap())
            .collect()
    }

    #[test]
    fn test_crc_known_vectors() {
        assert_eq!(crc16(&hex("01 03 00 00 00 01")), 0x0A84);
        assert_eq!(encode(0x01, 0x03, &hex("00 00 00 01")), hex("01 03 00 00 00 01 84 0A"));
        assert_eq!(encode(0x11, 0x03, &hex("00 6B 00 03")), hex("11 03 00 6B 00 03 76 87"));
        assert_eq!(encode(0x01, 0x03, &hex("00 00 00 0A")), hex("01 03 00 00 00 0A C5 CD"));
    }

    #[test]
    fn test_decode_valid() {
        let frame = decode(&hex("11 03 00 6B 00 03 76 87")).unwrap();
        assert_eq!(frame.address, 0x11);
        assert_eq!(frame.function_code, 0x03);
        assert_eq!(frame.payload, hex("00 6B 00 03"));
        assert!(!frame.is_exception());
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let err = decode(&hex("11 03 00 6B 00 03 76 88")).unwrap_err();
        assert_eq!(err.frame_kind(), Some(FrameErrorKind::CrcMismatch));
    }

    #[test]
    fn test_decode_too_short() {
        let err = decode(&hex("01 03 84")).unwrap_err();
        assert_eq!(err.frame_kind(), Some(FrameErrorKind::Malformed));
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_minimum_frame() {
        let bytes = encode(0x05, 0x07, &[]);
        assert_eq!(bytes.len(), MIN_RTU_FRAME_LEN);
        let frame = decode(&bytes).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_exception_frame() {
        let bytes = encode(0x01, 0x83, &[0x02]);
        let frame = decode(&bytes).unwrap();
        assert!(frame.is_exception());
        assert_eq!(frame.exception_code(), Some(0x02));
        assert_eq!(response_frame_len(&bytes), FrameLen::Known(5));
    }

    #[test]
    fn test_request_frame_len() {
        assert_eq!(request_frame_len(&[0x01]), FrameLen::Incomplete);
        assert_eq!(request_frame_len(&[0x01, 0x03]), FrameLen::Known(8));
        assert_eq!(
            request_frame_len(&[0x01, 0x10, 0x00, 0x00, 0x00]),
            FrameLen::Incomplete
        );
        assert_eq!(
            request_frame_len(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04]),
            FrameLen::Known(13)
        );
        assert_eq!(request_frame_len(&[0x01, 0x2B]), FrameLen::Indeterminate);
    }

    #[test]
    fn test_response_frame_len() {
        assert_eq!(response_frame_len(&[0x01, 0x03]), FrameLen::Incomplete);
        assert_eq!(response_frame_len(&[0x01, 0x03, 0x0A]), FrameLen::Known(15));
        assert_eq!(response_frame_len(&[0x01, 0x05]), FrameLen::Known(8));
        assert_eq!(response_frame_len(&[0x01, 0x2B]), FrameLen::Indeterminate);
    }

    #[test]
    fn test_frame_from_request() {
        let request = ModbusRequest::new_write_coil(0x01, 0, true);
        let frame = RtuFrame::from_request(&request).unwrap();
        let bytes = frame.encode();
        assert_eq!(&bytes[..6], &hex("01 05 00 00 FF 00"));
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x01, 0xAB, 0x00]), "01 AB 00");
        assert_eq!(format_hex(&[]), "");
    }
}
