//! Vozia session core
//!
//! Ties the Live transport to audio playback: the [`SessionController`] owns
//! the session configuration, routes model speech to a [`PlaybackSink`] and
//! recovers from a rejected voice. Configuration changes are pure functions
//! in [`config`]; the tutor persona lives in [`instructions`].

pub mod config;
pub mod controller;
pub mod instructions;
pub mod playback;

pub use controller::{SessionController, SessionError, SessionStatus};
pub use instructions::{TutorProfile, build_system_instruction};
pub use playback::PlaybackSink;
