//! Base-128 variable-length integers used throughout the Negentropy wire format.
//!
//! Groups are emitted most-significant-first; every byte but the last carries
//! the continuation bit (`0x80`).

use super::error::NegentropyError;

/// Appends the varint encoding of `n` to `out`.
pub fn encode(n: u64, out: &mut Vec<u8>) {
    let mut groups = Vec::with_capacity(10);
    let mut rest = n;
    loop {
        groups.push((rest & 0x7f) as u8);
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    while let Some(group) = groups.pop() {
        if groups.is_empty() {
            out.push(group);
        } else {
            out.push(group | 0x80);
        }
    }
}

/// Decodes a varint from the front of `bytes`, returning the value and the
/// remaining slice.
pub fn decode(bytes: &[u8]) -> Result<(u64, &[u8]), NegentropyError> {
    let mut value: u64 = 0;
    let mut consumed = 0;
    loop {
        let byte = *bytes
            .get(consumed)
            .ok_or(NegentropyError::BadMessage("truncated varint"))?;
        value = (value << 7) | u64::from(byte & 0x7f);
        consumed += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if consumed > 9 {
            return Err(NegentropyError::BadMessage("varint too long"));
        }
    }
    Ok((value, &bytes[consumed..]))
}
