//! Node encoder.

use super::node::{Content, Node};
use super::packed::{self, PackKind};
use super::{MAX_DEPTH, tags};
use crate::error::{CodecError, CodecResult};
use crate::token::{TokenCode, TokenDictionary};

/// Largest length a `BINARY_20` prefix can carry.
const BINARY_20_LIMIT: usize = 1 << 20;

/// Encodes nodes against a token dictionary.
pub struct NodeEncoder<'d> {
    dict: &'d TokenDictionary,
    buf: Vec<u8>,
}

impl<'d> NodeEncoder<'d> {
    /// Create an encoder using `dict`.
    #[must_use]
    pub fn new(dict: &'d TokenDictionary) -> Self {
        Self {
            dict,
            buf: Vec::with_capacity(256),
        }
    }

    /// Append one node.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooLarge`] for lists or byte strings that do
    /// not fit their prefix, and [`CodecError::TooDeep`] for trees nested
    /// deeper than the decoder accepts.
    pub fn write_node(&mut self, node: &Node) -> CodecResult<()> {
        self.write_node_at(node, 0)
    }

    /// Consume the encoder, returning the bytes written.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn write_node_at(&mut self, node: &Node, depth: usize) -> CodecResult<()> {
        if depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }

        let attrs = node.attr_pairs();
        let size = 2 * attrs.len() + 1 + usize::from(!node.content().is_empty());
        self.write_list_start(size)?;
        self.write_string(node.tag())?;
        for (key, value) in attrs {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        match node.content() {
            Content::Empty => {}
            Content::Text(text) => self.write_string(text)?,
            Content::Bytes(bytes) => self.write_bytes(bytes)?,
            Content::Children(children) => {
                self.write_list_start(children.len())?;
                for child in children {
                    self.write_node_at(child, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn write_list_start(&mut self, size: usize) -> CodecResult<()> {
        match size {
            0 => self.buf.push(tags::LIST_EMPTY),
            1..=255 => {
                self.buf.push(tags::LIST_8);
                self.buf.push(size as u8);
            }
            256..=65535 => {
                self.buf.push(tags::LIST_16);
                self.buf.extend_from_slice(&(size as u16).to_be_bytes());
            }
            _ => return Err(CodecError::TooLarge(size)),
        }
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> CodecResult<()> {
        if !s.contains('@') {
            return self.write_atom(s);
        }
        if self.write_token(s) {
            return Ok(());
        }

        // `a@b@c` nests as JID(a, JID(b, c)); written iteratively so input
        // length never turns into stack depth.
        let mut rest = s;
        while let Some((user, server)) = rest.split_once('@') {
            self.buf.push(tags::JID_PAIR);
            if user.is_empty() {
                self.buf.push(tags::LIST_EMPTY);
            } else {
                self.write_atom(user)?;
            }
            rest = server;
        }
        self.write_atom(rest)
    }

    /// Token, packed or raw form of a string without JID handling.
    fn write_atom(&mut self, s: &str) -> CodecResult<()> {
        if self.write_token(s) {
            return Ok(());
        }
        if let Some(packed) = packed::pack(s, PackKind::Nibble) {
            self.buf.push(tags::NIBBLE_8);
            self.buf.extend_from_slice(&packed);
            Ok(())
        } else if let Some(packed) = packed::pack(s, PackKind::Hex) {
            self.buf.push(tags::HEX_8);
            self.buf.extend_from_slice(&packed);
            Ok(())
        } else {
            self.write_bytes(s.as_bytes())
        }
    }

    fn write_token(&mut self, s: &str) -> bool {
        match self.dict.lookup(s) {
            Some(TokenCode::Single(code)) => self.buf.push(code),
            Some(TokenCode::Double { page, index }) => {
                self.buf.push(tags::DICTIONARY_0 + page);
                self.buf.push(index);
            }
            None => return false,
        }
        true
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let len = bytes.len();
        if len < 256 {
            self.buf.push(tags::BINARY_8);
            self.buf.push(len as u8);
        } else if len < BINARY_20_LIMIT {
            self.buf.push(tags::BINARY_20);
            self.buf.push(((len >> 16) & 0x0F) as u8);
            self.buf.push(((len >> 8) & 0xFF) as u8);
            self.buf.push((len & 0xFF) as u8);
        } else {
            let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
            self.buf.push(tags::BINARY_32);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// Encode `node` with the standard dictionary.
///
/// # Errors
///
/// See [`NodeEncoder::write_node`].
pub fn encode(node: &Node) -> CodecResult<Vec<u8>> {
    encode_with(node, TokenDictionary::standard())
}

/// Encode `node` with a caller-supplied dictionary.
///
/// # Errors
///
/// See [`NodeEncoder::write_node`].
pub fn encode_with(node: &Node, dict: &TokenDictionary) -> CodecResult<Vec<u8>> {
    let mut encoder = NodeEncoder::new(dict);
    encoder.write_node(node)?;
    Ok(encoder.finish())
}
