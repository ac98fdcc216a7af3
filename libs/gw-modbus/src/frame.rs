//! Modbus wire framing: RTU (CRC-16/Modbus) and TCP (MBAP header).
//! §6 EXTERNAL INTERFACES.

use gw_common::BusError;

/// CRC-16/Modbus: polynomial 0xA001, initial value 0xFFFF (§6).
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build an RTU request frame: `[slave_id][pdu...][crc_lo][crc_hi]`.
pub fn build_rtu_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Parse and CRC-validate an RTU response. Returns `(slave_id, pdu)`.
pub fn parse_rtu_frame(data: &[u8]) -> Result<(u8, &[u8]), BusError> {
    if data.len() < 4 {
        return Err(BusError::ConnectionFailed("RTU frame too short".into()));
    }
    let pdu_end = data.len() - 2;
    let expected = u16::from_le_bytes([data[pdu_end], data[pdu_end + 1]]);
    let actual = crc16_modbus(&data[..pdu_end]);
    if expected != actual {
        return Err(BusError::CrcMismatch {
            expected,
            actual,
        });
    }
    Ok((data[0], &data[1..pdu_end]))
}

/// MBAP header: `[transaction_id(2)][protocol_id(2)=0][length(2)][unit_id(1)]`.
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu_len: u16,
}

impl MbapHeader {
    pub fn to_bytes(&self) -> [u8; 7] {
        let length = self.pdu_len + 1; // + unit_id
        let mut bytes = [0u8; 7];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&0u16.to_be_bytes());
        bytes[4..6].copy_from_slice(&length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BusError> {
        if data.len() < 7 {
            return Err(BusError::InvalidMbap("header shorter than 7 bytes".into()));
        }
        let transaction_id = u16::from_be_bytes([data[0], data[1]]);
        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]);
        let unit_id = data[6];
        if protocol_id != 0 {
            return Err(BusError::InvalidMbap(format!(
                "protocol id must be 0, got {protocol_id}"
            )));
        }
        Ok(Self {
            transaction_id,
            unit_id,
            pdu_len: length.saturating_sub(1),
        })
    }
}

/// Build a complete MBAP + PDU frame for transmission over TCP.
pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader {
        transaction_id,
        unit_id,
        pdu_len: pdu.len() as u16,
    };
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(pdu);
    frame
}

/// Parse an MBAP+PDU frame. Returns `(transaction_id, unit_id, pdu)`.
pub fn parse_tcp_frame(data: &[u8]) -> Result<(u16, u8, &[u8]), BusError> {
    let header = MbapHeader::from_bytes(data)?;
    let total_len = 7 + header.pdu_len as usize;
    if data.len() < total_len {
        return Err(BusError::InvalidMbap("incomplete frame".into()));
    }
    Ok((header.transaction_id, header.unit_id, &data[7..total_len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_vector() {
        // 01 03 00 01 00 02 -> known CRC 0x95C4 (matches the teacher's test vector)
        let data = [0x01, 0x03, 0x00, 0x01, 0x00, 0x02];
        assert_eq!(crc16_modbus(&data), 0x95C4);
    }

    #[test]
    fn rtu_round_trip() {
        let pdu = [0x03, 0x00, 0x01, 0x00, 0x02];
        let frame = build_rtu_frame(0x01, &pdu);
        let (slave, parsed_pdu) = parse_rtu_frame(&frame).unwrap();
        assert_eq!(slave, 0x01);
        assert_eq!(parsed_pdu, &pdu);
    }

    #[test]
    fn rtu_crc_mismatch_detected() {
        let pdu = [0x03, 0x00, 0x01, 0x00, 0x02];
        let mut frame = build_rtu_frame(0x01, &pdu);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(parse_rtu_frame(&frame), Err(BusError::CrcMismatch { .. })));
    }

    #[test]
    fn mbap_round_trip() {
        let pdu = [0x03, 0x00, 0x01, 0x00, 0x02];
        let frame = build_tcp_frame(0x1234, 0x01, &pdu);
        let (txn, unit, parsed_pdu) = parse_tcp_frame(&frame).unwrap();
        assert_eq!(txn, 0x1234);
        assert_eq!(unit, 0x01);
        assert_eq!(parsed_pdu, &pdu);
    }

    #[test]
    fn mbap_rejects_nonzero_protocol_id() {
        let mut bytes = build_tcp_frame(1, 1, &[0x03, 0, 0, 0, 1]);
        bytes[3] = 1; // protocol_id low byte
        assert!(matches!(parse_tcp_frame(&bytes), Err(BusError::InvalidMbap(_))));
    }
}
