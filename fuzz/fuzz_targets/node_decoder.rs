//! Fuzz target for the binary node decoder
//!
//! Arbitrary bytes must decode or fail cleanly, and anything that decodes
//! must re-encode to bytes that decode to the same node.

#![no_main]

use chatwire_core::{decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(node) = decode(data) else {
        return;
    };
    let bytes = encode(&node).expect("decoded node re-encodes");
    let again = decode(&bytes).expect("re-encoded node decodes");
    assert_eq!(again, node);
});
