//! Wire tag bytes.

/// Empty list (also the empty left half of a JID pair)
pub const LIST_EMPTY: u8 = 0;
/// End of stream marker
pub const STREAM_END: u8 = 2;
/// Index of the first real single-byte token
pub const FIRST_TOKEN: u8 = 3;
/// Highest single-byte token index
pub const MAX_SINGLE_TOKEN: u8 = 235;
/// First double-byte dictionary page tag (pages 0..=3)
pub const DICTIONARY_0: u8 = 236;
/// Last double-byte dictionary page tag
pub const DICTIONARY_3: u8 = 239;
/// List with a one-byte size
pub const LIST_8: u8 = 248;
/// List with a two-byte size
pub const LIST_16: u8 = 249;
/// `user@server` pair
pub const JID_PAIR: u8 = 250;
/// Hex-packed string
pub const HEX_8: u8 = 251;
/// Bytes with a one-byte length
pub const BINARY_8: u8 = 252;
/// Bytes with a 20-bit length
pub const BINARY_20: u8 = 253;
/// Bytes with a 32-bit length
pub const BINARY_32: u8 = 254;
/// Nibble-packed string
pub const NIBBLE_8: u8 = 255;

/// Whether `tag` starts a list.
#[must_use]
pub const fn is_list(tag: u8) -> bool {
    matches!(tag, LIST_EMPTY | LIST_8 | LIST_16)
}

/// Whether `tag` starts a length-prefixed byte string.
#[must_use]
pub const fn is_binary(tag: u8) -> bool {
    matches!(tag, BINARY_8 | BINARY_20 | BINARY_32)
}
