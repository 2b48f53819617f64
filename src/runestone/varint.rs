//! Unsigned LEB128: 7 bits per byte, continuation bit in the MSB.

use crate::error::{Error, Result};

/// A u128 never needs more than 19 bytes.
const MAX_LEN: usize = 19;

pub fn encode_to_vec(mut n: u128, out: &mut Vec<u8>) {
    while n >> 7 > 0 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

pub fn encode(n: u128) -> Vec<u8> {
    let mut v = Vec::with_capacity(MAX_LEN);
    encode_to_vec(n, &mut v);
    v
}

/// Decode one integer, returning it and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u128, usize)> {
    let mut n: u128 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_LEN {
            return Err(Error::MalformedRunestone("overlong varint".into()));
        }
        let value = u128::from(byte & 0x7f);
        // The 19th byte may only carry the top two bits of a u128.
        if i == MAX_LEN - 1 && value & 0x7c != 0 {
            return Err(Error::MalformedRunestone("varint overflows 128 bits".into()));
        }
        n |= value << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
    }
    Err(Error::MalformedRunestone("unterminated varint".into()))
}

/// Decode a whole buffer into a flat integer list.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<u128>> {
    let mut integers = Vec::new();
    while !buf.is_empty() {
        let (n, len) = decode(buf)?;
        integers.push(n);
        buf = &buf[len..];
    }
    Ok(integers)
}
