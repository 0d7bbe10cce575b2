//! Owner authentication
//!
//! The owner API is protected by a single bearer token from configuration.

mod middleware;

pub use middleware::{Owner, tokens_match};
