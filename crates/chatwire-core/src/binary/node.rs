//! The protocol tree.

use crate::error::{CodecError, CodecResult};

/// Node payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Content {
    /// No payload
    #[default]
    Empty,
    /// String payload
    Text(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Nested nodes (possibly none)
    Children(Vec<Node>),
}

impl Content {
    /// Whether this is [`Content::Empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// A tagged tree node: `tag`, ordered attributes and content.
///
/// The tag is never empty and attribute keys are unique; setting an existing
/// key replaces its value in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    tag: String,
    attrs: Vec<(String, String)>,
    content: Content,
}

impl Node {
    /// Create a node with no attributes and no content.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmptyTag`] if `tag` is empty.
    pub fn new(tag: impl Into<String>) -> CodecResult<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CodecError::EmptyTag);
        }
        Ok(Self {
            tag,
            attrs: Vec::new(),
            content: Content::Empty,
        })
    }

    /// Builder form of [`set_attr`](Self::set_attr).
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Replace the content.
    #[must_use]
    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    /// Set text content.
    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_content(Content::Text(text.into()))
    }

    /// Set byte content.
    #[must_use]
    pub fn with_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.with_content(Content::Bytes(bytes.into()))
    }

    /// Set child content.
    #[must_use]
    pub fn with_children(self, children: Vec<Node>) -> Self {
        self.with_content(Content::Children(children))
    }

    /// Set `key` to `value`, replacing an existing value in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    /// Node tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Attribute value for `key`.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attributes in insertion order.
    pub fn attrs(&self) -> impl ExactSizeIterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes.
    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    /// Node content.
    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Take the content, leaving [`Content::Empty`].
    pub fn take_content(&mut self) -> Content {
        std::mem::take(&mut self.content)
    }

    /// Child nodes, or an empty slice for non-list content.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        match &self.content {
            Content::Children(children) => children,
            _ => &[],
        }
    }

    /// First child with `tag`.
    #[must_use]
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// Payload as bytes for text or byte content.
    ///
    /// Strings that travel as raw bytes decode as [`Content::Bytes`], so
    /// callers that expect either should use this accessor.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Text(text) => Some(text.as_bytes()),
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn from_parts(tag: String, attrs: Vec<(String, String)>, content: Content) -> Self {
        Self {
            tag,
            attrs,
            content,
        }
    }

    pub(crate) fn attr_pairs(&self) -> &[(String, String)] {
        &self.attrs
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attrs {
            write!(f, " {k}=\"{v}\"")?;
        }
        match &self.content {
            Content::Empty => write!(f, "/>"),
            Content::Text(text) => write!(f, ">{text}</{}>", self.tag),
            Content::Bytes(bytes) => write!(f, ">[{} bytes]</{}>", bytes.len(), self.tag),
            Content::Children(children) => {
                write!(f, ">")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}
