//! Live Coach - realtime voice assistant and product content helper
//!
//! This library provides the core functionality for the coach:
//! - Microphone capture, PCM transport codec and gapless playback
//! - A duplex streaming session with a live voice model
//! - The session controller state machine tying them together
//! - One-shot marketing copy and image enhancement from product photos
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Session Controller                   │
//! │   Idle → Connecting → Live → Error / Closed          │
//! └──────┬──────────────────┬───────────────────┬────────┘
//!        │                  │                   │
//! ┌──────▼──────┐   ┌───────▼────────┐   ┌──────▼────────┐
//! │   Capture   │──▶│ Live session   │──▶│   Playback    │
//! │ 16kHz mono  │   │ (WebSocket)    │   │ scheduler     │
//! └─────────────┘   └────────────────┘   └───────────────┘
//! ```

pub mod config;
pub mod content;
pub mod controller;
pub mod error;
pub mod live;
pub mod voice;

pub use config::Config;
pub use content::{ContentClient, EnhancedImage, GeneratedContent};
pub use controller::{ControlCommand, ControllerHandle, SessionController, SessionState, SessionStatus};
pub use error::{Error, Result};
