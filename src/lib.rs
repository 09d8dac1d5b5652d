#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use bridge::{
    AudioChunk, AudioPayload, BoxFuture, BridgeBuilder, ClientSink, Collaborators, Connection,
    Connector, FrameSink, FrameSource, OutputItem, Readiness, ReadinessGate, SessionManager,
    SessionState, SessionTasks, ToolContent, ToolDefinition, ToolDispatcher, ToolRegistry,
    ToolResult, ToolTurn, Transcript, TranscriptEntry, TranscriptRole, WsConnector,
};
pub use config::BridgeConfig;
pub use error::{Error, Result, ServiceError, ServiceErrorKind};
pub use protocol::{ClientFrame, EventKind, StreamEvent};

use base64::Engine as _;
use base64::engine::general_purpose;
use futures::{SinkExt, StreamExt};
use protocol::events::AudioInput;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use transport::ws::WsStream;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Low-level client for the remote bidirectional speech stream.
///
/// Thread safety: `RemoteClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`. Split it to read and write concurrently.
#[must_use]
pub struct RemoteClient {
    stream: WsStream,
    max_audio_chunk_bytes: usize,
}

impl RemoteClient {
    /// Connect using the endpoint and credentials in `config`.
    ///
    /// # Errors
    /// Returns an error if the endpoint is invalid or the connection fails.
    pub async fn connect(config: &BridgeConfig) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        let stream =
            transport::ws::connect(&endpoint, &config.model_id, config.authorization.as_deref()).await?;
        Ok(Self { stream, max_audio_chunk_bytes: config.max_audio_chunk_bytes })
    }

    /// Split the client into a sender and a receiver for concurrent usage.
    pub fn split(self) -> (RemoteSender, RemoteReceiver) {
        let (write, read) = self.stream.split();
        (
            RemoteSender { write, max_audio_chunk_bytes: self.max_audio_chunk_bytes },
            RemoteReceiver { read },
        )
    }
}

enum Incoming {
    Frame(String),
    End,
    Skip,
    Fault(Error),
}

fn classify_message(msg: std::result::Result<Message, WsError>) -> Incoming {
    match msg {
        Ok(Message::Text(text)) => {
            tracing::trace!("Received frame: {}", safe_truncate(text.as_str(), TRACE_LOG_MAX_BYTES));
            Incoming::Frame(text.as_str().to_owned())
        }
        Ok(Message::Binary(bytes)) => Incoming::Frame(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(Message::Close(_)) => {
            tracing::info!("Speech stream closed by remote");
            Incoming::End
        }
        Ok(_) => Incoming::Skip,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Incoming::End,
        Err(e) => Incoming::Fault(e.into()),
    }
}

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

/// The sending half of a split `RemoteClient`.
pub struct RemoteSender {
    write: futures::stream::SplitSink<WsStream, Message>,
    max_audio_chunk_bytes: usize,
}

impl RemoteSender {
    /// Send one frame.
    ///
    /// # Errors
    /// Returns an error if validation, serialization or sending fails.
    pub async fn send(&mut self, event: &StreamEvent) -> Result<()> {
        validate_outbound(event, self.max_audio_chunk_bytes)?;
        let json = event.to_json()?;
        tracing::trace!("Sending frame (split): {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Close the write side. Closing an already closed stream is not an error.
    ///
    /// # Errors
    /// Returns an error if the close handshake fails for another reason.
    pub async fn close(&mut self) -> Result<()> {
        match self.write.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The receiving half of a split `RemoteClient`.
pub struct RemoteReceiver {
    read: futures::stream::SplitStream<WsStream>,
}

impl RemoteReceiver {
    /// Receive the next raw frame. `None` signals end of stream.
    ///
    /// # Errors
    /// Returns an error if the WebSocket fails.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.read.next().await {
            match classify_message(msg) {
                Incoming::Frame(text) => return Ok(Some(text)),
                Incoming::End => return Ok(None),
                Incoming::Skip => {}
                Incoming::Fault(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn validate_outbound(event: &StreamEvent, max_audio_bytes: usize) -> Result<()> {
    if event.kind() != &EventKind::AudioInput {
        return Ok(());
    }
    let audio: AudioInput = event.fields_as()?;
    let content = audio.content.unwrap_or_default();
    let size = general_purpose::STANDARD
        .decode(content.as_bytes())
        .map_err(|err| Error::InvalidClientEvent(format!("audioInput invalid base64: {err}")))?
        .len();
    if size > max_audio_bytes {
        return Err(Error::InvalidClientEvent(format!(
            "audioInput exceeds {max_audio_bytes} bytes ({size} bytes)",
        )));
    }
    Ok(())
}
