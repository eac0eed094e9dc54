//! ASCII-safe binary encoding for embedding fixed-width integers and
//! doubles inside the JSON index file (spec §3/§6).
//!
//! This is the standard ZeroMQ Z85 alphabet applied to 4-byte big-endian
//! blocks: every 4 input bytes become exactly 5 output characters, which is
//! what lets [`crate::index::entry`] rewrite an encoded field in place
//! without changing the byte length of the surrounding JSON.
//!
//! Offsets into the index file (`pointer`, `link`, skip-list `levels`) are
//! encoded as 48-bit unsigned values — two 4-byte blocks, 10 characters —
//! rather than 32-bit, so a multi-gigabyte index file doesn't overflow the
//! addressable range. The type tag is a plain 32-bit value (5 characters).
//! Numbers are encoded as their IEEE-754 double bit pattern, also two
//! blocks (10 characters), matching spec §3's "10 chars" note.

use crate::error::{Error, Result};

const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

fn decode_table() -> [i8; 256] {
    let mut table = [-1i8; 256];
    for (value, &byte) in ALPHABET.iter().enumerate() {
        table[byte as usize] = value as i8;
    }
    table
}

/// Encodes a byte slice whose length is a multiple of 4 into Z85.
fn encode_block(bytes: &[u8]) -> String {
    debug_assert_eq!(bytes.len() % 4, 0);
    let mut out = String::with_capacity(bytes.len() / 4 * 5);
    for chunk in bytes.chunks(4) {
        let mut value: u32 = 0;
        for &byte in chunk {
            value = value.wrapping_mul(256).wrapping_add(byte as u32);
        }
        let mut digits = [0u8; 5];
        let mut v = value;
        for slot in digits.iter_mut().rev() {
            *slot = ALPHABET[(v % 85) as usize];
            v /= 85;
        }
        out.push_str(std::str::from_utf8(&digits).expect("alphabet is ASCII"));
    }
    out
}

/// Decodes a Z85 string whose length is a multiple of 5 back to bytes.
fn decode_block(s: &str) -> Result<Vec<u8>> {
    if s.len() % 5 != 0 {
        return Err(Error::invalid_format(
            "<z85>",
            format!("z85 string {s:?} has length {} (not a multiple of 5)", s.len()),
        ));
    }
    let table = decode_table();
    let mut out = Vec::with_capacity(s.len() / 5 * 4);
    for chunk in s.as_bytes().chunks(5) {
        let mut value: u64 = 0;
        for &byte in chunk {
            let digit = table[byte as usize];
            if digit < 0 {
                return Err(Error::invalid_format(
                    "<z85>",
                    format!("invalid z85 character {:?}", byte as char),
                ));
            }
            value = value * 85 + digit as u64;
        }
        if value > u32::MAX as u64 {
            return Err(Error::invalid_format("<z85>", "z85 block overflows 32 bits"));
        }
        out.extend_from_slice(&(value as u32).to_be_bytes());
    }
    Ok(out)
}

/// Encodes a `u32` as a fixed-width, 5-character Z85 string.
pub fn encode_u32(value: u32) -> String {
    encode_block(&value.to_be_bytes())
}

/// Decodes a fixed-width 5-character Z85 string to a `u32`.
pub fn decode_u32(s: &str) -> Result<u32> {
    let bytes = decode_block(s)?;
    if bytes.len() != 4 {
        return Err(Error::invalid_format("<z85>", "expected a 4-byte z85 u32"));
    }
    Ok(u32::from_be_bytes(bytes.try_into().expect("checked length")))
}

/// Encodes a 48-bit unsigned value (e.g. a file offset) as a fixed-width,
/// 10-character Z85 string. `value` must fit in 48 bits.
pub fn encode_u48(value: u64) -> String {
    debug_assert!(value <= 0xFFFF_FFFF_FFFF, "value does not fit in 48 bits");
    encode_block(&value.to_be_bytes())
}

/// Decodes a fixed-width 10-character Z85 string to a 48-bit unsigned
/// value stored in a `u64`.
pub fn decode_u48(s: &str) -> Result<u64> {
    let bytes = decode_block(s)?;
    if bytes.len() != 8 {
        return Err(Error::invalid_format("<z85>", "expected an 8-byte z85 u48"));
    }
    let value = u64::from_be_bytes(bytes.try_into().expect("checked length"));
    if value > 0xFFFF_FFFF_FFFF {
        return Err(Error::invalid_format("<z85>", "z85 u48 value exceeds 48 bits"));
    }
    Ok(value)
}

/// Encodes a finite `f64` as a fixed-width, 10-character Z85 string.
pub fn encode_f64(value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(Error::invalid_format("<z85>", "cannot encode a non-finite number"));
    }
    Ok(encode_block(&value.to_bits().to_be_bytes()))
}

/// Decodes a fixed-width 10-character Z85 string to an `f64`.
pub fn decode_f64(s: &str) -> Result<f64> {
    let bytes = decode_block(s)?;
    if bytes.len() != 8 {
        return Err(Error::invalid_format("<z85>", "expected an 8-byte z85 f64"));
    }
    let value = f64::from_bits(u64::from_be_bytes(bytes.try_into().expect("checked length")));
    if !value.is_finite() {
        return Err(Error::invalid_format("<z85>", "decoded a non-finite number"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trips() {
        for value in [0u32, 1, 42, u32::MAX, 1_000_000] {
            let encoded = encode_u32(value);
            assert_eq!(encoded.len(), 5);
            assert_eq!(decode_u32(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn u48_round_trips() {
        for value in [0u64, 1, 4096, 0xFFFF_FFFF_FFFF] {
            let encoded = encode_u48(value);
            assert_eq!(encoded.len(), 10);
            assert_eq!(decode_u48(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn f64_round_trips() {
        for value in [0.0, -0.0, 1.5, 42.0, f64::MIN_POSITIVE, -123456.789] {
            let encoded = encode_f64(value).unwrap();
            assert_eq!(encoded.len(), 10);
            assert_eq!(decode_f64(&encoded).unwrap().to_bits(), value.to_bits());
        }
    }

    #[test]
    fn rejects_non_finite_numbers() {
        assert!(encode_f64(f64::NAN).is_err());
        assert!(encode_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(decode_u32("abc").is_err());
        assert!(decode_u32("abcdef").is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(decode_u32("\"\"\"\"\"").is_err());
    }
}
