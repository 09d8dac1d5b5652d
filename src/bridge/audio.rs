use super::session::SessionManager;
use super::state::{self, SessionState};
use crate::protocol::StreamEvent;
use base64::Engine as _;
use base64::engine::general_purpose;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Audio bytes as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    /// Already base64 encoded, forwarded as-is.
    Base64(String),
    /// Raw PCM bytes, encoded on send.
    Raw(Vec<u8>),
}

impl AudioPayload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Base64(s) => s.is_empty(),
            Self::Raw(b) => b.is_empty(),
        }
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        match self {
            Self::Base64(s) => s.clone(),
            Self::Raw(b) => general_purpose::STANDARD.encode(b),
        }
    }
}

/// One queued chunk of microphone audio for an open prompt/content pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub prompt_name: String,
    pub content_name: String,
    pub payload: AudioPayload,
}

impl AudioChunk {
    #[must_use]
    pub fn new(prompt_name: impl Into<String>, content_name: impl Into<String>, payload: AudioPayload) -> Self {
        Self {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            payload,
        }
    }

    /// Chunks missing a prompt, content, or payload cannot be framed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.prompt_name.is_empty() && !self.content_name.is_empty() && !self.payload.is_empty()
    }

    #[must_use]
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::audio_input(&self.prompt_name, &self.content_name, &self.payload.to_base64())
    }
}

/// Entry on the audio queue.
#[derive(Debug)]
pub(crate) enum PumpItem {
    Chunk(AudioChunk),
    /// Answered once every chunk queued ahead of it has been written.
    Flush(oneshot::Sender<()>),
}

/// Drain the audio queue into the remote stream while the session is active.
///
/// The exit check only runs between chunks, so a chunk that has been taken off
/// the queue is always written whole.
pub(crate) async fn run_audio_pump(
    session: Arc<SessionManager>,
    mut audio_rx: mpsc::Receiver<PumpItem>,
    mut state_rx: watch::Receiver<SessionState>,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = state::inactive(&mut state_rx) => break,
            item = audio_rx.recv() => item,
        };
        let chunk = match item {
            Some(PumpItem::Chunk(chunk)) => chunk,
            Some(PumpItem::Flush(done)) => {
                let _ = done.send(());
                continue;
            }
            None => break,
        };

        if !chunk.is_complete() {
            tracing::warn!("Dropping audio chunk with missing prompt, content, or payload");
            continue;
        }

        match session.send_event(chunk.to_event()).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "Audio pump stopping on transport fault");
                break;
            }
            Err(err) => tracing::warn!(error = %err, "Failed to send audio chunk"),
        }
    }
    tracing::debug!("Audio pump exited");
}
