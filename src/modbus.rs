//! Modbus/TCP frame parser
//!
//! Validates the MBAP header (transaction, protocol, length, unit) and
//! decodes the function code. The length field counts the unit identifier
//! plus the PDU, so a well-formed frame satisfies
//! `length == payload_len - 6`. Anything that fails validation is reported
//! with a typed reason and surfaces downstream as a malformed-frame alert.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Modbus/TCP server port
pub const MODBUS_TCP_PORT: u16 = 502;

/// MBAP header (7 bytes) plus at least the function code
pub const MIN_FRAME_LEN: usize = 8;

/// Largest frame the protocol allows on the wire
pub const MAX_FRAME_LEN: usize = 260;

/// Function codes that read process data
pub const READ_FUNCTIONS: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x07, 0x14, 0x17];

/// Function codes that write process data
pub const WRITE_FUNCTIONS: &[u8] = &[0x05, 0x06, 0x0F, 0x10, 0x16, 0x17];

/// Diagnostic and identification function codes
pub const DIAGNOSTIC_FUNCTIONS: &[u8] = &[0x08, 0x0B, 0x0C, 0x11];

/// Why a frame failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, need at least {MIN_FRAME_LEN}")]
    TooShort(usize),
    #[error("protocol id {0:#06x} is not Modbus")]
    BadProtocolId(u16),
    #[error("length field {declared} does not cover {actual} trailing bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("frame exceeds {MAX_FRAME_LEN} bytes: {0}")]
    Oversized(usize),
}

/// Coarse classification of a function code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionClass {
    Read,
    Write,
    /// Read/Write Multiple Registers (0x17) both reads and writes
    ReadWrite,
    Diagnostic,
    UnknownFunction,
}

/// Classify a (masked) function code into its operation class
pub fn classify_function(code: u8) -> FunctionClass {
    let reads = READ_FUNCTIONS.contains(&code);
    let writes = WRITE_FUNCTIONS.contains(&code);
    match (reads, writes) {
        (true, true) => FunctionClass::ReadWrite,
        (true, false) => FunctionClass::Read,
        (false, true) => FunctionClass::Write,
        (false, false) if DIAGNOSTIC_FUNCTIONS.contains(&code) => FunctionClass::Diagnostic,
        _ => FunctionClass::UnknownFunction,
    }
}

/// A parsed Modbus/TCP frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    /// Raw function code as seen on the wire (high bit set on exceptions)
    pub function_code: u8,
    pub is_exception: bool,
    /// Bytes following the function code
    pub pdu: Vec<u8>,
}

impl ModbusFrame {
    /// Function code with the exception bit masked off
    #[inline]
    pub fn function(&self) -> u8 {
        self.function_code & 0x7F
    }

    pub fn class(&self) -> FunctionClass {
        classify_function(self.function())
    }

    pub fn is_read(&self) -> bool {
        READ_FUNCTIONS.contains(&self.function())
    }

    pub fn is_write(&self) -> bool {
        WRITE_FUNCTIONS.contains(&self.function())
    }

    pub fn is_diagnostic(&self) -> bool {
        DIAGNOSTIC_FUNCTIONS.contains(&self.function())
    }
}

/// Length-field handling mode
///
/// `Strict` requires the MBAP length field to exactly cover the unit id and
/// PDU. `Lenient` skips only that cross-check, for wire compatibility with
/// devices that pad or misreport the field; protocol id, minimum size and
/// the 260-byte cap are always enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthValidation {
    Strict,
    Lenient,
}

/// Modbus/TCP payload parser
#[derive(Debug, Clone, Copy)]
pub struct ModbusParser {
    validation: LengthValidation,
}

impl ModbusParser {
    pub fn new() -> Self {
        Self {
            validation: LengthValidation::Strict,
        }
    }

    pub fn lenient() -> Self {
        Self {
            validation: LengthValidation::Lenient,
        }
    }

    pub fn validation(&self) -> LengthValidation {
        self.validation
    }

    /// Parse a TCP payload as a Modbus/TCP frame
    pub fn parse(&self, payload: &[u8]) -> Result<ModbusFrame, FrameError> {
        if payload.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort(payload.len()));
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(payload.len()));
        }

        let transaction_id = u16::from_be_bytes([payload[0], payload[1]]);
        let protocol_id = u16::from_be_bytes([payload[2], payload[3]]);
        let length = u16::from_be_bytes([payload[4], payload[5]]);
        let unit_id = payload[6];

        if protocol_id != 0 {
            return Err(FrameError::BadProtocolId(protocol_id));
        }

        // The length field counts everything after itself: unit id + PDU.
        let trailing = payload.len() - 6;
        if self.validation == LengthValidation::Strict && length as usize != trailing {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: trailing,
            });
        }

        let function_code = payload[7];

        Ok(ModbusFrame {
            transaction_id,
            protocol_id,
            length,
            unit_id,
            function_code,
            is_exception: function_code & 0x80 != 0,
            pdu: payload[8..].to_vec(),
        })
    }
}

impl Default for ModbusParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a Modbus/TCP frame for tests and traffic generation
pub fn build_frame(transaction_id: u16, unit_id: u8, function_code: u8, data: &[u8]) -> Vec<u8> {
    let length = (data.len() + 2) as u16; // unit id + function + data
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.push(function_code);
    frame.extend_from_slice(data);
    frame
}
