//! Modbus PDU construction and parsing for the function codes §6 lists:
//! 01/02/03/04 (reads), 05/06 (single writes), 15/16 (multiple writes).

use gw_common::model::FunctionCode;
use gw_common::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Other(u8),
}

impl From<u8> for ModbusException {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            0x04 => ModbusException::SlaveDeviceFailure,
            other => ModbusException::Other(other),
        }
    }
}

fn read_function_code(fc: FunctionCode) -> u8 {
    fc as u8
}

/// Build a read request PDU for any of the four read function codes.
pub fn build_read_request(fc: FunctionCode, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(read_function_code(fc));
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Decoded bytes from a read response's data section, still in
/// Modbus register order (big-endian 16-bit words, or raw bits for coils).
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPayload {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Parse a read response PDU. `fc` must match the request's function code.
pub fn parse_read_response(fc: FunctionCode, pdu: &[u8]) -> Result<ReadPayload, BusError> {
    check_exception(read_function_code(fc), pdu)?;
    if pdu.is_empty() || pdu[0] != read_function_code(fc) {
        return Err(BusError::Exception(pdu.first().copied().unwrap_or(0)));
    }
    let byte_count = *pdu.get(1).ok_or_else(|| invalid("missing byte count"))? as usize;
    let data = pdu.get(2..2 + byte_count).ok_or_else(|| invalid("short payload"))?;

    if fc.is_bit_type() {
        let mut bits = Vec::with_capacity(byte_count * 8);
        for byte in data {
            for i in 0..8 {
                bits.push(byte & (1 << i) != 0);
            }
        }
        Ok(ReadPayload::Bits(bits))
    } else {
        if byte_count % 2 != 0 {
            return Err(invalid("odd byte count for register read"));
        }
        let words = data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(ReadPayload::Words(words))
    }
}

/// Build a "write single coil" (FC05) request. Modbus encodes ON as
/// 0xFF00 and OFF as 0x0000.
pub fn build_write_single_coil(address: u16, value: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(0x05);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    pdu
}

/// Build a "write single holding register" (FC06) request.
pub fn build_write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(0x06);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build a "write multiple registers" (FC16) request.
pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> Vec<u8> {
    let byte_count = (values.len() * 2) as u8;
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(0x10);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count);
    for v in values {
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    pdu
}

/// Build a "write multiple coils" (FC15) request.
pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> Vec<u8> {
    let byte_count = (values.len() + 7) / 8;
    let mut packed = vec![0u8; byte_count];
    for (i, &v) in values.iter().enumerate() {
        if v {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(0x0F);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

/// A write response just echoes the function code, address and value/count;
/// the caller already knows what it sent, so parsing is reduced to an
/// exception check plus function-code confirmation.
pub fn parse_write_response(expected_fc: u8, pdu: &[u8]) -> Result<(), BusError> {
    check_exception(expected_fc, pdu)?;
    if pdu.first() != Some(&expected_fc) {
        return Err(invalid("unexpected function code in write response"));
    }
    Ok(())
}

fn check_exception(request_fc: u8, pdu: &[u8]) -> Result<(), BusError> {
    if let Some(&fc) = pdu.first() {
        if fc == request_fc | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(BusError::Exception(code));
        }
    }
    Ok(())
}

fn invalid(msg: &str) -> BusError {
    BusError::InvalidAddress(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_request_shape() {
        let pdu = build_read_request(FunctionCode::Holding, 0x0001, 0x0002);
        assert_eq!(pdu, vec![0x03, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn read_holding_response_words() {
        let pdu = [0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B];
        let parsed = parse_read_response(FunctionCode::Holding, &pdu).unwrap();
        assert_eq!(parsed, ReadPayload::Words(vec![10, 11]));
    }

    #[test]
    fn read_coil_response_bits() {
        let pdu = [0x01, 0x01, 0b0000_0101];
        let parsed = parse_read_response(FunctionCode::Coil, &pdu).unwrap();
        assert_eq!(parsed, ReadPayload::Bits(vec![true, false, true, false, false, false, false, false]));
    }

    #[test]
    fn exception_response_detected() {
        let pdu = [0x83, 0x02]; // FC03 | 0x80, illegal data address
        let err = parse_read_response(FunctionCode::Holding, &pdu).unwrap_err();
        assert!(matches!(err, BusError::Exception(2)));
        assert_eq!(ModbusException::from(2), ModbusException::IllegalDataAddress);
    }

    #[test]
    fn write_single_register_round_trip() {
        let pdu = build_write_single_register(0x0010, 0x1234);
        assert_eq!(pdu, vec![0x06, 0x00, 0x10, 0x12, 0x34]);
        parse_write_response(0x06, &pdu).unwrap();
    }

    #[test]
    fn write_multiple_registers_shape() {
        let pdu = build_write_multiple_registers(0x0000, &[1, 2, 3]);
        assert_eq!(pdu, vec![0x10, 0x00, 0x00, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]);
    }

    #[test]
    fn write_multiple_coils_packs_bits() {
        let pdu = build_write_multiple_coils(0x0000, &[true, false, true]);
        assert_eq!(pdu, vec![0x0F, 0x00, 0x00, 0x00, 0x03, 0x01, 0b0000_0101]);
    }
}
