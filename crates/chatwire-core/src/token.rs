//! Token dictionary.
//!
//! Frequent protocol strings are sent as a single byte (an index into the
//! single-byte table) or as two bytes (a dictionary page tag followed by an
//! index into that page). Indices 0..=2 of the single-byte table are
//! reserved for list and stream markers; the first real token sits at
//! index 3.
//!
//! The default dictionary is built once and shared. Custom dictionaries can
//! be built for tests or for servers that negotiate paged tokens.

use crate::binary::tags;
use crate::error::{CodecError, CodecResult};
use std::collections::HashMap;
use std::sync::LazyLock;

pub use crate::binary::tags::FIRST_TOKEN;

/// Number of double-byte dictionary pages.
pub const DICTIONARY_PAGES: usize = 4;

/// Single-byte tokens starting at index [`FIRST_TOKEN`].
pub const SINGLE_BYTE_TOKENS: &[&str] = &[
    "200", "400", "404", "500", "501", "502", "action", "add", "after", "archive", "author",
    "available", "battery", "before", "body", "broadcast", "chat", "clear", "code", "composing",
    "contacts", "count", "create", "debug", "delete", "demote", "duplicate", "encoding",
    "error", "false", "filehash", "from", "g.us", "group", "groups_v2", "height", "id", "image",
    "in", "index", "invis", "item", "jid", "kind", "last", "leave", "live", "log", "media",
    "message", "mimetype", "missing", "modify", "name", "notification", "notify", "out",
    "owner", "participant", "paused", "picture", "played", "presence", "preview", "promote",
    "query", "raw", "read", "receipt", "received", "recipient", "recording", "relay", "remove",
    "response", "resume", "retry", "s.whatsapp.net", "seconds", "set", "size", "status",
    "subject", "subscribe", "t", "text", "to", "true", "type", "unarchive", "unavailable",
    "url", "user", "value", "web", "width", "mute", "read_only", "admin", "creator", "short",
    "update", "powersave", "checksum", "epoch", "block", "previous", "409", "replaced",
    "reason", "spam", "modify_tag", "message_info", "delivery", "emoji", "title", "description",
    "canonical-url", "matched-text", "star", "unstar", "media_key", "filename", "identity",
    "unread", "page", "page_count", "search", "media_message", "security", "call_log",
    "profile", "ciphertext", "invite", "gif", "vcard", "frequent", "privacy", "blacklist",
    "whitelist", "verify", "location", "document", "elapsed", "revoke_invite", "expiration",
    "unsubscribe", "disable", "vname", "old_jid", "new_jid", "announcement", "locked", "prop",
    "label", "color", "call", "offer", "call-id", "quick_reply", "sticker", "pay_t", "accept",
    "reject", "sticker_pack", "invalid", "canceled", "missed", "connected", "result", "audio",
    "video", "recent",
];

static DEFAULT: LazyLock<TokenDictionary> = LazyLock::new(|| TokenDictionary {
    single: SINGLE_BYTE_TOKENS.iter().map(|s| (*s).to_string()).collect(),
    pages: Vec::new(),
    index: build_index(SINGLE_BYTE_TOKENS.iter().copied(), &[]),
});

/// Wire encoding of a dictionary hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenCode {
    /// One byte: the single-byte table index
    Single(u8),
    /// Two bytes: `DICTIONARY_0 + page`, then `index`
    Double {
        /// Dictionary page (0..4)
        page: u8,
        /// Index within the page
        index: u8,
    },
}

/// Bidirectional string/token table.
#[derive(Debug, Clone)]
pub struct TokenDictionary {
    single: Vec<String>,
    pages: Vec<Vec<String>>,
    index: HashMap<String, TokenCode>,
}

impl TokenDictionary {
    /// The shared default dictionary.
    #[must_use]
    pub fn standard() -> &'static TokenDictionary {
        &DEFAULT
    }

    /// Build a custom dictionary.
    ///
    /// `single` is placed starting at index [`FIRST_TOKEN`]; `pages` holds up
    /// to [`DICTIONARY_PAGES`] pages of at most 256 entries each. A string
    /// present in both tables is encoded with its single-byte code.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooLarge`] if a table does not fit its code space.
    pub fn new(single: &[&str], pages: &[&[&str]]) -> CodecResult<Self> {
        let max_single = usize::from(tags::MAX_SINGLE_TOKEN - FIRST_TOKEN) + 1;
        if single.len() > max_single {
            return Err(CodecError::TooLarge(single.len()));
        }
        if pages.len() > DICTIONARY_PAGES {
            return Err(CodecError::TooLarge(pages.len()));
        }
        if let Some(page) = pages.iter().find(|page| page.len() > 256) {
            return Err(CodecError::TooLarge(page.len()));
        }

        Ok(Self {
            single: single.iter().map(|s| (*s).to_string()).collect(),
            pages: pages
                .iter()
                .map(|page| page.iter().map(|s| (*s).to_string()).collect())
                .collect(),
            index: build_index(single.iter().copied(), pages),
        })
    }

    /// Find the code for `token`. Absence is not an error.
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<TokenCode> {
        self.index.get(token).copied()
    }

    /// String for a single-byte code.
    #[must_use]
    pub fn reverse_single(&self, code: u8) -> Option<&str> {
        let slot = code.checked_sub(FIRST_TOKEN)?;
        self.single.get(usize::from(slot)).map(String::as_str)
    }

    /// String for a double-byte code.
    #[must_use]
    pub fn reverse_double(&self, page: u8, index: u8) -> Option<&str> {
        self.pages
            .get(usize::from(page))?
            .get(usize::from(index))
            .map(String::as_str)
    }

    /// Number of single-byte tokens.
    #[must_use]
    pub fn single_len(&self) -> usize {
        self.single.len()
    }
}

fn build_index<'a>(
    single: impl Iterator<Item = &'a str>,
    pages: &[&[&str]],
) -> HashMap<String, TokenCode> {
    let mut index = HashMap::new();
    for (page_no, page) in pages.iter().enumerate() {
        for (i, token) in page.iter().enumerate() {
            index
                .entry((*token).to_string())
                .or_insert(TokenCode::Double {
                    page: page_no as u8,
                    index: i as u8,
                });
        }
    }
    // Single-byte codes win over paged ones.
    for (i, token) in single.enumerate() {
        index.insert(token.to_string(), TokenCode::Single(FIRST_TOKEN + i as u8));
    }
    index
}
