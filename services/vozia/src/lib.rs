//! Vozia Terminal Client Library Crate
//!
//! Everything the `vozia` binary needs around the session controller:
//! environment configuration, command line arguments, document loading, and
//! the quiz and graph tools the tutor can call. The binary in `bin/vozia.rs`
//! wires these together with a terminal prompt.

pub mod cli;
pub mod config;
pub mod document;
pub mod tools;
