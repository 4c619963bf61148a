//! Shared plumbing for the relay binaries: configuration loading and the
//! console log format.

pub mod config;
pub mod logging;
