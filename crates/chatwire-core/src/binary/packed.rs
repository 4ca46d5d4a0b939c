//! Nibble and hex packing.
//!
//! Short strings drawn from a 16-symbol alphabet travel as two symbols per
//! byte. The start byte carries the packed byte count in its low 7 bits and
//! an odd-length flag in its high bit; an odd string pads the final low
//! nibble with `0xF`.

use crate::error::{CodecError, CodecResult};

/// Longest string eligible for packing.
pub const MAX_PACKED_LEN: usize = 254;

const ODD_FLAG: u8 = 0x80;
const PAD: u8 = 0x0F;

/// Packing alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKind {
    /// `0-9`, `-`, `.`
    Nibble,
    /// `0-9`, `A-F`
    Hex,
}

impl PackKind {
    fn encode_char(self, c: u8) -> Option<u8> {
        match (self, c) {
            (_, b'0'..=b'9') => Some(c - b'0'),
            (Self::Nibble, b'-') => Some(10),
            (Self::Nibble, b'.') => Some(11),
            (Self::Hex, b'A'..=b'F') => Some(c - b'A' + 10),
            _ => None,
        }
    }

    fn decode_value(self, v: u8) -> CodecResult<char> {
        match (self, v) {
            (_, 0..=9) => Ok(char::from(b'0' + v)),
            (Self::Nibble, 10) => Ok('-'),
            (Self::Nibble, 11) => Ok('.'),
            (Self::Hex, 10..=15) => Ok(char::from(b'A' + v - 10)),
            _ => Err(CodecError::InvalidPacked(v)),
        }
    }

    /// Whether `s` can be packed with this alphabet.
    #[must_use]
    pub fn can_pack(self, s: &str) -> bool {
        !s.is_empty()
            && s.len() <= MAX_PACKED_LEN
            && s.bytes().all(|c| self.encode_char(c).is_some())
    }
}

/// Pack `s`, returning the start byte followed by the packed bytes.
///
/// Returns `None` if `s` is not packable with `kind`.
#[must_use]
pub fn pack(s: &str, kind: PackKind) -> Option<Vec<u8>> {
    if !kind.can_pack(s) {
        return None;
    }
    let bytes = s.as_bytes();
    let odd = bytes.len() % 2 == 1;
    let packed_len = bytes.len().div_ceil(2);

    let mut out = Vec::with_capacity(1 + packed_len);
    out.push(if odd { ODD_FLAG } else { 0 } | packed_len as u8);
    for pair in bytes.chunks(2) {
        let hi = kind.encode_char(pair[0])?;
        let lo = match pair.get(1) {
            Some(&c) => kind.encode_char(c)?,
            None => PAD,
        };
        out.push((hi << 4) | lo);
    }
    Some(out)
}

/// Number of packed bytes announced by `start`.
#[must_use]
pub fn packed_len(start: u8) -> usize {
    usize::from(start & !ODD_FLAG)
}

/// Unpack the bytes that follow start byte `start`.
///
/// # Errors
///
/// Returns [`CodecError::InvalidPacked`] for an empty run, a symbol outside
/// the alphabet or a pad nibble anywhere but the final position.
pub fn unpack(start: u8, data: &[u8], kind: PackKind) -> CodecResult<String> {
    let odd = start & ODD_FLAG != 0;
    if data.is_empty() {
        return Err(CodecError::InvalidPacked(start));
    }

    let mut out = String::with_capacity(data.len() * 2);
    for (i, &byte) in data.iter().enumerate() {
        out.push(kind.decode_value(byte >> 4)?);
        let lo = byte & 0x0F;
        if odd && i == data.len() - 1 {
            if lo != PAD {
                return Err(CodecError::InvalidPacked(lo));
            }
        } else {
            out.push(kind.decode_value(lo)?);
        }
    }
    Ok(out)
}
