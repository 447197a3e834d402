//! `mh-domain`: configuration and shared error types for mcp-harness.
//!
//! The config structs live here (rather than in `mh-mcp-client`) so the
//! binary can deserialize and validate them without pulling in the
//! process and protocol machinery.

pub mod config;
pub mod error;
