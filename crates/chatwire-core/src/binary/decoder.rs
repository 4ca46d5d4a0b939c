//! Node decoder.
//!
//! Every read is bounds-checked before it happens; malformed input yields a
//! [`CodecError`] and never panics.

use super::node::{Content, Node};
use super::packed::{self, PackKind};
use super::{MAX_DEPTH, tags};
use crate::error::{CodecError, CodecResult};
use crate::token::TokenDictionary;
use std::collections::HashSet;

/// Decodes nodes from a byte slice.
pub struct NodeDecoder<'a, 'd> {
    data: &'a [u8],
    pos: usize,
    dict: &'d TokenDictionary,
}

impl<'a, 'd> NodeDecoder<'a, 'd> {
    /// Create a decoder over `data`.
    #[must_use]
    pub fn new(data: &'a [u8], dict: &'d TokenDictionary) -> Self {
        Self { data, pos: 0, dict }
    }

    /// Read one node from the current position.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing the first malformation found.
    pub fn read_node(&mut self) -> CodecResult<Node> {
        self.read_node_at(0)
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_node_at(&mut self, depth: usize) -> CodecResult<Node> {
        if depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }

        let size = self.read_list_size()?;
        if size == 0 {
            return Err(CodecError::EmptyNode);
        }

        if self.peek()? == tags::STREAM_END {
            return Err(CodecError::UnexpectedStreamEnd);
        }
        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(CodecError::EmptyTag);
        }

        let attr_count = (size - 1) / 2;
        let mut attrs: Vec<(String, String)> = Vec::with_capacity(attr_count.min(64));
        let mut seen = HashSet::with_capacity(attr_count.min(64));
        for _ in 0..attr_count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            if !seen.insert(key.clone()) {
                return Err(CodecError::DuplicateAttribute(key));
            }
            attrs.push((key, value));
        }

        let content = if size % 2 == 0 {
            self.read_content(depth)?
        } else {
            Content::Empty
        };

        Ok(Node::from_parts(tag, attrs, content))
    }

    fn read_content(&mut self, depth: usize) -> CodecResult<Content> {
        let tag = self.peek()?;
        if tags::is_list(tag) {
            let count = self.read_list_size()?;
            let mut children = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                children.push(self.read_node_at(depth + 1)?);
            }
            Ok(Content::Children(children))
        } else if tags::is_binary(tag) {
            let tag = self.read_u8()?;
            let bytes = self.read_binary(tag)?;
            Ok(Content::Bytes(bytes.to_vec()))
        } else {
            Ok(Content::Text(self.read_string()?))
        }
    }

    fn read_list_size(&mut self) -> CodecResult<usize> {
        let offset = self.pos;
        match self.read_u8()? {
            tags::LIST_EMPTY => Ok(0),
            tags::LIST_8 => Ok(usize::from(self.read_u8()?)),
            tags::LIST_16 => {
                let bytes = self.take(2)?;
                Ok(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
            }
            tag => Err(CodecError::UnexpectedTag { tag, offset }),
        }
    }

    fn read_string(&mut self) -> CodecResult<String> {
        if self.peek()? != tags::JID_PAIR {
            return self.read_atom();
        }

        // Nested pairs are read iteratively; see the encoder.
        let mut out = String::new();
        while self.peek()? == tags::JID_PAIR {
            self.pos += 1;
            if self.peek()? == tags::LIST_EMPTY {
                self.pos += 1;
            } else {
                out.push_str(&self.read_atom()?);
            }
            out.push('@');
        }
        out.push_str(&self.read_atom()?);
        Ok(out)
    }

    /// Token, packed or raw string.
    fn read_atom(&mut self) -> CodecResult<String> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        match tag {
            tags::FIRST_TOKEN..=tags::MAX_SINGLE_TOKEN => self
                .dict
                .reverse_single(tag)
                .map(str::to_string)
                .ok_or(CodecError::InvalidToken(tag)),
            tags::DICTIONARY_0..=tags::DICTIONARY_3 => {
                let page = tag - tags::DICTIONARY_0;
                let index = self.read_u8()?;
                self.dict
                    .reverse_double(page, index)
                    .map(str::to_string)
                    .ok_or(CodecError::InvalidDoubleToken { page, index })
            }
            tags::NIBBLE_8 => self.read_packed(PackKind::Nibble),
            tags::HEX_8 => self.read_packed(PackKind::Hex),
            tags::BINARY_8 | tags::BINARY_20 | tags::BINARY_32 => {
                let bytes = self.read_binary(tag)?;
                String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
            }
            tag => Err(CodecError::UnexpectedTag { tag, offset }),
        }
    }

    fn read_packed(&mut self, kind: PackKind) -> CodecResult<String> {
        let start = self.read_u8()?;
        let data = self.take(packed::packed_len(start))?;
        packed::unpack(start, data, kind)
    }

    fn read_binary(&mut self, tag: u8) -> CodecResult<&'a [u8]> {
        let len = match tag {
            tags::BINARY_8 => usize::from(self.read_u8()?),
            tags::BINARY_20 => {
                let b = self.take(3)?;
                (usize::from(b[0] & 0x0F) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
            }
            _ => {
                let b = self.take(4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
        };
        self.take(len)
    }

    fn peek(&self) -> CodecResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: 1,
            })
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// Decode one node with the standard dictionary.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed input or trailing bytes.
pub fn decode(data: &[u8]) -> CodecResult<Node> {
    decode_with(data, TokenDictionary::standard())
}

/// Decode one node with a caller-supplied dictionary.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed input or trailing bytes.
pub fn decode_with(data: &[u8], dict: &TokenDictionary) -> CodecResult<Node> {
    let mut decoder = NodeDecoder::new(data, dict);
    let node = decoder.read_node()?;
    match decoder.remaining() {
        0 => Ok(node),
        n => Err(CodecError::TrailingBytes(n)),
    }
}
