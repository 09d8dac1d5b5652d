//! Frame envelope shared by the client boundary and the remote stream.

pub mod client_frames;
pub mod events;

pub use client_frames::{ClientFrame, INBOUND_EVENTS};
pub use events::{
    AudioInput, ContentEnd, ContentStart, ContentType, EventKind, GenerationStage, Names, Role,
    StreamEvent, TextOutput, ToolUse, TIMESTAMP_KEY,
};
