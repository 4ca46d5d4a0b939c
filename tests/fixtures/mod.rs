//! Test fixtures: a scripted in-memory server and client builders.

pub mod mock_server;

pub use mock_server::{
    CLIENT_TOKEN, MockServer, SERVER_TOKEN, ServerConn, WID, build_client, next_event,
    test_config,
};
