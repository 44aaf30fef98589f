use serde::{Deserialize, Serialize};

use super::config::DataType;

/// Word/byte ordering for 32-bit values spanning two registers.
///
/// Registers arrive as big-endian 16-bit words per the Modbus convention;
/// vendors disagree on how the two words of a 32-bit value are arranged.
/// `big`/`little` are accepted as legacy aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordOrder {
    #[serde(rename = "ABCD", alias = "abcd", alias = "big")]
    Abcd,
    #[serde(rename = "CDAB", alias = "cdab")]
    Cdab,
    #[serde(rename = "BADC", alias = "badc")]
    Badc,
    #[serde(rename = "DCBA", alias = "dcba", alias = "little")]
    Dcba,
}

impl Default for WordOrder {
    fn default() -> Self {
        Self::Abcd
    }
}

fn swap_bytes(word: u16) -> u16 {
    word.rotate_left(8)
}

/// Combine two registers into a u32 honoring the word order. Register 0
/// holds bytes A,B and register 1 holds bytes C,D as received.
pub fn decode_u32(words: [u16; 2], order: WordOrder) -> u32 {
    let [w0, w1] = words;
    match order {
        WordOrder::Abcd => ((w0 as u32) << 16) | w1 as u32,
        WordOrder::Cdab => ((w1 as u32) << 16) | w0 as u32,
        WordOrder::Badc => ((swap_bytes(w0) as u32) << 16) | swap_bytes(w1) as u32,
        WordOrder::Dcba => ((swap_bytes(w1) as u32) << 16) | swap_bytes(w0) as u32,
    }
}

/// Decode raw register words into an engineering value. Single-register
/// values are always big-endian; the word order only applies to 32-bit
/// types.
pub fn decode_value(words: &[u16], data_type: DataType, order: WordOrder) -> Option<f64> {
    match data_type {
        DataType::U16 => words.first().map(|w| *w as f64),
        DataType::I16 => words.first().map(|w| (*w as i16) as f64),
        DataType::U32 => {
            let raw = decode_u32([*words.first()?, *words.get(1)?], order);
            Some(raw as f64)
        }
        DataType::I32 => {
            let raw = decode_u32([*words.first()?, *words.get(1)?], order);
            Some((raw as i32) as f64)
        }
        DataType::F32 => {
            let raw = decode_u32([*words.first()?, *words.get(1)?], order);
            let value = f32::from_bits(raw);
            value.is_finite().then_some(value as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0x12345678 split into words [0x1234, 0x5678] on an ABCD wire.
    const WORDS: [u16; 2] = [0x1234, 0x5678];

    #[test]
    fn test_word_orders() {
        assert_eq!(decode_u32(WORDS, WordOrder::Abcd), 0x1234_5678);
        assert_eq!(decode_u32(WORDS, WordOrder::Cdab), 0x5678_1234);
        assert_eq!(decode_u32(WORDS, WordOrder::Badc), 0x3412_7856);
        assert_eq!(decode_u32(WORDS, WordOrder::Dcba), 0x7856_3412);
    }

    #[test]
    fn test_decode_i16_sign_extension() {
        assert_eq!(
            decode_value(&[0xFFFE], DataType::I16, WordOrder::Abcd),
            Some(-2.0)
        );
        assert_eq!(
            decode_value(&[0xFFFE], DataType::U16, WordOrder::Abcd),
            Some(65534.0)
        );
    }

    #[test]
    fn test_decode_f32() {
        let bits = 21.5_f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(
            decode_value(&words, DataType::F32, WordOrder::Abcd),
            Some(21.5)
        );

        // Same value with swapped words decodes under CDAB.
        let swapped = [words[1], words[0]];
        assert_eq!(
            decode_value(&swapped, DataType::F32, WordOrder::Cdab),
            Some(21.5)
        );
    }

    #[test]
    fn test_decode_f32_rejects_nan() {
        let bits = f32::NAN.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode_value(&words, DataType::F32, WordOrder::Abcd), None);
    }

    #[test]
    fn test_decode_i32_negative() {
        let raw = (-123456_i32) as u32;
        let words = [(raw >> 16) as u16, raw as u16];
        assert_eq!(
            decode_value(&words, DataType::I32, WordOrder::Abcd),
            Some(-123456.0)
        );
    }

    #[test]
    fn test_short_slice_yields_none() {
        assert_eq!(decode_value(&[0x1234], DataType::F32, WordOrder::Abcd), None);
        assert_eq!(decode_value(&[], DataType::U16, WordOrder::Abcd), None);
    }

    #[test]
    fn test_legacy_aliases() {
        let big: WordOrder = serde_json::from_str("\"big\"").unwrap();
        let little: WordOrder = serde_json::from_str("\"little\"").unwrap();
        assert_eq!(big, WordOrder::Abcd);
        assert_eq!(little, WordOrder::Dcba);
    }
}
