//! Pure register decoding: raw Modbus words -> calibrated engineering value.
//! §4.2 COMPONENT DESIGN.

use gw_common::model::{DataTypeBase, Endianness, RegisterConfig};
use gw_common::DecodeError;

/// Reorder raw registers into the byte sequence the numeric codec expects,
/// then decode per `data_type`, then apply scale/offset/decimals (§4.2: the
/// calibration order is scale first, offset second, rounding last).
pub fn decode_register(cfg: &RegisterConfig, raw: &[u16]) -> Result<f64, DecodeError> {
    let expected = cfg.data_type.word_count() as usize;
    if raw.len() != expected {
        return Err(DecodeError::WrongWordCount {
            expected,
            actual: raw.len(),
        });
    }

    let raw_value = decode_raw(cfg.data_type, cfg.endianness, raw);
    let calibrated = cfg.scale * raw_value + cfg.offset;
    Ok(apply_decimals(calibrated, cfg.decimals))
}

fn ordered_bytes(endianness: Endianness, raw: &[u16]) -> Vec<u8> {
    match endianness {
        // Word order and byte order both as received.
        Endianness::Be => raw.iter().flat_map(|w| w.to_be_bytes()).collect(),
        // Full reversal of the BE byte sequence: word order *and* the
        // bytes within each word are both reversed.
        Endianness::Le => {
            let mut bytes: Vec<u8> = raw.iter().flat_map(|w| w.to_be_bytes()).collect();
            bytes.reverse();
            bytes
        }
        // Word order preserved; bytes swapped within each word.
        Endianness::BeBs => raw.iter().flat_map(|w| w.to_le_bytes()).collect(),
        // Word order reversed; bytes within each word left in BE order.
        Endianness::LeBs => {
            let mut words = raw.to_vec();
            words.reverse();
            words.iter().flat_map(|w| w.to_be_bytes()).collect()
        }
    }
}

fn decode_raw(data_type: DataTypeBase, endianness: Endianness, raw: &[u16]) -> f64 {
    if matches!(data_type, DataTypeBase::Bool) {
        return if raw[0] != 0 { 1.0 } else { 0.0 };
    }

    let bytes = ordered_bytes(endianness, raw);
    match data_type {
        DataTypeBase::Bool => unreachable!(),
        DataTypeBase::Int16 => i16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        DataTypeBase::Uint16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        DataTypeBase::Int32 => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
        DataTypeBase::Uint32 => {
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
        DataTypeBase::Float32 => {
            f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
        DataTypeBase::Int64 => i64::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataTypeBase::Uint64 => u64::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataTypeBase::Double64 => f64::from_be_bytes(bytes.try_into().unwrap()),
    }
}

/// -1 means "no rounding"; 0..=6 rounds half-away-from-zero to that many
/// decimal places (§8: `12.345` at 2 decimals rounds to `12.35`, `-12.345`
/// rounds to `-12.35`).
fn apply_decimals(value: f64, decimals: i8) -> f64 {
    if decimals < 0 {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_common::model::FunctionCode;

    fn cfg(data_type: DataTypeBase, endianness: Endianness, scale: f64, offset: f64, decimals: i8) -> RegisterConfig {
        RegisterConfig {
            register_id: "R1".into(),
            register_name: "test".into(),
            address: 0,
            function_code: FunctionCode::Holding,
            data_type,
            endianness,
            scale,
            offset,
            decimals,
            unit: String::new(),
            writable: true,
            min_value: None,
            max_value: None,
            register_index: 0,
        }
    }

    #[test]
    fn uint16_be_identity() {
        let c = cfg(DataTypeBase::Uint16, Endianness::Be, 1.0, 0.0, -1);
        assert_eq!(decode_register(&c, &[0x1234]).unwrap(), 0x1234 as f64);
    }

    #[test]
    fn float32_be_word_order() {
        // 100.5f32 = 0x42C90000
        let c = cfg(DataTypeBase::Float32, Endianness::Be, 1.0, 0.0, -1);
        let v = decode_register(&c, &[0x42C9, 0x0000]).unwrap();
        assert!((v - 100.5).abs() < 1e-6);
    }

    #[test]
    fn float32_be_bs_swaps_bytes_within_word_only() {
        let c = cfg(DataTypeBase::Float32, Endianness::BeBs, 1.0, 0.0, -1);
        // 100.5f32 canonical BE bytes are 42 C9 00 00; BE_BS keeps word
        // order and swaps bytes within each word, so the wire words are
        // the byte-swap of 0x42C9 and 0x0000.
        let v = decode_register(&c, &[0xC942, 0x0000]).unwrap();
        assert!((v - 100.5).abs() < 1e-6);
    }

    #[test]
    fn int32_le_round_trip() {
        let c = cfg(DataTypeBase::Int32, Endianness::Le, 1.0, 0.0, -1);
        // 0x11223344 canonical; LE reverses the full BE byte sequence, so
        // the wire words decode back to 0x44332211.
        let v = decode_register(&c, &[0x1122, 0x3344]).unwrap();
        assert_eq!(v, 0x44332211_i32 as f64);
    }

    #[test]
    fn endianness_variants_distinct_byte_vectors() {
        // Same raw words, all four endianness variants, each expected to
        // decode to a different value (catches word/byte-order transposition
        // bugs that palindromic 0xFFFF vectors can't).
        let raw = [0x1122, 0x3344];
        let be = cfg(DataTypeBase::Uint32, Endianness::Be, 1.0, 0.0, -1);
        let le = cfg(DataTypeBase::Uint32, Endianness::Le, 1.0, 0.0, -1);
        let be_bs = cfg(DataTypeBase::Uint32, Endianness::BeBs, 1.0, 0.0, -1);
        let le_bs = cfg(DataTypeBase::Uint32, Endianness::LeBs, 1.0, 0.0, -1);

        assert_eq!(decode_register(&be, &raw).unwrap(), 0x11223344_u32 as f64);
        assert_eq!(decode_register(&le, &raw).unwrap(), 0x44332211_u32 as f64);
        assert_eq!(decode_register(&be_bs, &raw).unwrap(), 0x22114433_u32 as f64);
        assert_eq!(decode_register(&le_bs, &raw).unwrap(), 0x33441122_u32 as f64);
    }

    #[test]
    fn calibration_scale_then_offset_then_round() {
        let c = cfg(DataTypeBase::Uint16, Endianness::Be, 0.1, 5.0, 2);
        // raw 100 -> 0.1*100 + 5 = 15.0 -> round to 2 decimals stays 15.0
        assert_eq!(decode_register(&c, &[100]).unwrap(), 15.0);
    }

    #[test]
    fn rounding_half_away_from_zero() {
        let c = cfg(DataTypeBase::Uint16, Endianness::Be, 1.0, 0.0, 0);
        // emulate 12.345 pre-rounded value by using scale
        let c2 = cfg(DataTypeBase::Uint16, Endianness::Be, 0.12345, 0.0, 2);
        let v = decode_register(&c2, &[100000_u16.min(u16::MAX)]).unwrap_or(0.0);
        let _ = c;
        let _ = v;
        // direct unit check on the rounding helper behavior via a clean value
        let rounded = apply_decimals(12.345, 2);
        assert_eq!(rounded, 12.35);
        let rounded_neg = apply_decimals(-12.345, 2);
        assert_eq!(rounded_neg, -12.35);
    }

    #[test]
    fn wrong_word_count_rejected() {
        let c = cfg(DataTypeBase::Float32, Endianness::Be, 1.0, 0.0, -1);
        let err = decode_register(&c, &[0x0000]).unwrap_err();
        assert!(matches!(err, DecodeError::WrongWordCount { expected: 2, actual: 1 }));
    }
}
