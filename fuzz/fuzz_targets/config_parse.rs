//! Fuzz target for client configuration parsing
//!
//! Arbitrary TOML must parse or fail cleanly, and validation of whatever
//! parses must not panic.

#![no_main]

use chatwire_core::ClientConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = toml::from_str::<ClientConfig>(s) else {
        return;
    };
    let _ = config.validate();
    let _ = config.connection.prologue_bytes();
    let _ = config.connection.server_static_key_bytes();
    let _ = config.storage.session_key_bytes();
});
