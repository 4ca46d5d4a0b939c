//! Binary node codec.
//!
//! Every protocol message is a tree of [`Node`]s serialized as:
//!
//! ```text
//! node    := list_start(2*attrs + 1 + has_content) tag (key value)* content?
//! content := string | bytes | list_start(n) node{n}
//! string  := token | dict_page index | JID_PAIR user server
//!          | NIBBLE_8 packed | HEX_8 packed | bytes
//! bytes   := BINARY_8 u8 data | BINARY_20 u20 data | BINARY_32 u32 data
//! ```
//!
//! Frequent strings are replaced by dictionary tokens (see
//! [`crate::token`]), numeric and hex strings are packed two symbols per
//! byte, and `user@server` identifiers are split into a pair.
//!
//! Strings that fall back to raw bytes are indistinguishable on the wire
//! from byte content, so such `Text` content decodes as `Bytes`.

mod decoder;
mod encoder;
mod node;
pub mod packed;
pub mod tags;

pub use decoder::{NodeDecoder, decode, decode_with};
pub use encoder::{NodeEncoder, encode, encode_with};
pub use node::{Content, Node};

/// Maximum node nesting depth accepted by the encoder and decoder.
pub const MAX_DEPTH: usize = 64;
