//! Streaming session with the remote live voice service

pub mod protocol;
mod session;

pub use protocol::{ClientMessage, Content, Part, ServerContent, ServerMessage};
pub use session::{
    DEFAULT_OUTBOUND_CAPACITY, GeminiLive, LiveConfig, LiveEvent, LiveLink, LiveSession,
    OutboundSender, SessionEvent, SessionId, VoiceTransport,
};
