//! Duplex bridge between one client connection and one remote speech session.
//!
//! A [`Connection`] owns a [`SessionManager`], which owns the remote stream and
//! two background tasks: the reader (remote frames to the output queue, tool
//! turns to the dispatcher) and the audio pump (client audio to the remote
//! stream). A third task forwards the output queue to the [`ClientSink`].

mod audio;
mod builder;
pub mod builtin;
mod connection;
mod dispatch;
mod output;
mod reader;
mod session;
mod state;
mod tools;
mod transcript;
mod transport;

pub use audio::{AudioChunk, AudioPayload};
pub use builder::BridgeBuilder;
pub use builtin::{
    AgentClient, Collaborators, KnowledgeBase, LocationSearch, Profile, ProfileStore, TranscriptStore,
};
pub use connection::Connection;
pub use dispatch::{ToolDispatcher, result_frames};
pub use output::{ClientSink, OutputItem};
pub use session::{SessionManager, SessionTasks};
pub use state::{Readiness, ReadinessGate, SessionState};
pub use tools::{NO_RESULT, TOOL_FAILURE, ToolContent, ToolDefinition, ToolRegistry, ToolResult, ToolTurn};
pub use transcript::{Transcript, TranscriptEntry, TranscriptRole};
pub use transport::{BoxFuture, Connector, FrameSink, FrameSource, WsConnector};
