//! Voicelink Service Crate
//!
//! Everything the `voicelink` binary needs around the streaming engine:
//! environment configuration, the cpal audio backend, the terminal front end
//! and the loopback peer server. The binary is a thin wrapper around this
//! library.

pub mod config;
pub mod console;
#[cfg(feature = "device")]
pub mod device;
pub mod server;
