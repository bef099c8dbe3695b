//! voicegate - real-time voice-call mediation between a telephony switch,
//! a streaming ASR service, and a TTS service.
//!
//! Design principles:
//! - One orchestrator task consumes the switch event stream; per-call state
//!   serialises on the call record, not on global locks
//! - Sockets are single-owner: one writer task per socket, producers go
//!   through channels
//! - Cancellation is cooperative and cascades along the call lifecycle
//! - Every deferred timer is tracked so shutdown drains deterministically

pub mod admin;
pub mod allowlist;
pub mod asr;
pub mod audio;
pub mod call;
pub mod capture;
pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod playback;
pub mod switch;
pub mod tts;
pub mod util;
pub mod webhook;

pub use call::{CallId, CallState};
pub use config::Config;
pub use error::{Error, Result, TimeoutKind};
pub use orchestrator::Orchestrator;
