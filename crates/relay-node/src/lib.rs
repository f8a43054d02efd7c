//! # Relay Node
//!
//! The Agent Relay daemon process: configuration, the per-workspace daemon
//! (Unix socket and WebSocket listeners around a router), the
//! multi-workspace orchestrator, and the HTTP/WebSocket surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod daemon;
pub mod http;
pub mod metrics;
pub mod orchestrator;

mod error;

pub use error::{NodeError, Result};
