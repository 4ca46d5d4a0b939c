//! Shared fixtures for chatwire integration tests.

pub mod fixtures;
