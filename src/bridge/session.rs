use super::audio::{AudioChunk, PumpItem, run_audio_pump};
use super::dispatch::ToolDispatcher;
use super::output::OutputItem;
use super::reader::run_reader;
use super::state::{self, Readiness, ReadinessGate, SessionState, StateCell};
use super::transport::{Connector, FrameSink};
use crate::config::BridgeConfig;
use crate::protocol::events::{AudioInput, ContentType, EventKind, Names};
use crate::protocol::StreamEvent;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Handles of the background tasks spawned by [`SessionManager::initialize`].
#[derive(Debug)]
pub struct SessionTasks {
    pub reader: JoinHandle<()>,
    pub audio_pump: JoinHandle<()>,
}

/// Prompt and content names the client has opened on the remote stream.
#[derive(Debug, Default)]
struct OpenContent {
    prompt_name: Option<String>,
    audio_content: Option<String>,
    text_content: Option<String>,
    open: HashSet<String>,
}

impl OpenContent {
    fn track(&mut self, event: &StreamEvent) {
        let Ok(names) = event.fields_as::<Names>() else {
            return;
        };
        match event.kind() {
            EventKind::PromptStart => self.prompt_name = names.prompt_name,
            EventKind::PromptEnd => {
                self.prompt_name = None;
                self.audio_content = None;
                self.text_content = None;
                self.open.clear();
            }
            EventKind::ContentStart => {
                let Some(name) = names.content_name else { return };
                match names.content_type {
                    Some(ContentType::Audio) => self.audio_content = Some(name.clone()),
                    Some(ContentType::Text) => self.text_content = Some(name.clone()),
                    _ => {}
                }
                self.open.insert(name);
            }
            EventKind::ContentEnd => {
                let Some(name) = names.content_name else { return };
                if self.audio_content.as_deref() == Some(name.as_str()) {
                    self.audio_content = None;
                }
                if self.text_content.as_deref() == Some(name.as_str()) {
                    self.text_content = None;
                }
                self.open.remove(&name);
            }
            _ => {}
        }
    }
}

/// Owns the remote stream for one session.
///
/// All writes go through one async mutex, so frames from the audio pump, the
/// tool dispatcher and the client never interleave mid-frame, and a batch
/// written with [`send_atomic`](Self::send_atomic) is never split.
pub struct SessionManager {
    id: String,
    config: BridgeConfig,
    state: StateCell,
    gate: ReadinessGate,
    writer: Mutex<Option<Box<dyn FrameSink>>>,
    audio_tx: mpsc::Sender<PumpItem>,
    audio_rx: StdMutex<Option<mpsc::Receiver<PumpItem>>>,
    output_tx: StdMutex<Option<broadcast::Sender<OutputItem>>>,
    dispatcher: ToolDispatcher,
    content: StdMutex<OpenContent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.id)
            .field("model_id", &self.config.model_id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a session in the `New` state together with the receiving end
    /// of its output queue.
    #[must_use]
    pub fn new(config: BridgeConfig, dispatcher: ToolDispatcher) -> (Arc<Self>, broadcast::Receiver<OutputItem>) {
        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue_capacity);
        let (output_tx, output_rx) = broadcast::channel(config.output_queue_capacity);
        let session = Self {
            id: Uuid::new_v4().to_string(),
            config,
            state: StateCell::new(),
            gate: ReadinessGate::new(),
            writer: Mutex::new(None),
            audio_tx,
            audio_rx: StdMutex::new(Some(audio_rx)),
            output_tx: StdMutex::new(Some(output_tx)),
            dispatcher,
            content: StdMutex::new(OpenContent::default()),
            closed: AtomicBool::new(false),
        };
        (Arc::new(session), output_rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub const fn readiness(&self) -> &ReadinessGate {
        &self.gate
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Prompt name from the most recent `promptStart` the client sent.
    #[must_use]
    pub fn prompt_name(&self) -> Option<String> {
        self.content.lock().ok().and_then(|c| c.prompt_name.clone())
    }

    #[must_use]
    pub fn audio_content_name(&self) -> Option<String> {
        self.content.lock().ok().and_then(|c| c.audio_content.clone())
    }

    #[must_use]
    pub fn text_content_name(&self) -> Option<String> {
        self.content.lock().ok().and_then(|c| c.text_content.clone())
    }

    #[must_use]
    pub fn is_content_open(&self, content_name: &str) -> bool {
        self.content.lock().is_ok_and(|c| c.open.contains(content_name))
    }

    pub(crate) fn mark(&self, state: SessionState) -> bool {
        self.state.advance(state)
    }

    /// Open the remote stream and spawn the reader and audio pump.
    ///
    /// # Errors
    /// Returns the transport fault if the stream cannot be opened; the state
    /// becomes `Error`, the readiness gate is released, and no task is spawned.
    pub async fn initialize(self: &Arc<Self>, connector: &dyn Connector) -> Result<SessionTasks> {
        let taken = (
            self.output_tx.lock().ok().and_then(|mut slot| slot.take()),
            self.audio_rx.lock().ok().and_then(|mut slot| slot.take()),
        );
        let (Some(output_tx), Some(audio_rx)) = taken else {
            return Err(Error::InvalidClientEvent("session already initialized".to_string()));
        };

        let (sink, source) = match connector.open(&self.config).await {
            Ok(halves) => halves,
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "Failed to open speech stream");
                self.state.advance(SessionState::Error);
                self.gate.release(Readiness::Failed(err.to_string()));
                let _ = output_tx.send(OutputItem::Error(err.to_string()));
                return Err(err);
            }
        };

        *self.writer.lock().await = Some(sink);
        if !self.state.advance(SessionState::Active) {
            // closed while the stream was opening
            self.gate.release(Readiness::Failed("session closed during setup".to_string()));
            return Err(Error::SessionInactive);
        }

        let reader = tokio::spawn(
            run_reader(Arc::clone(self), source, output_tx)
                .instrument(tracing::info_span!("s2s_reader", session_id = %self.id)),
        );
        let audio_pump = tokio::spawn(
            run_audio_pump(Arc::clone(self), audio_rx, self.state.subscribe())
                .instrument(tracing::info_span!("s2s_audio", session_id = %self.id)),
        );

        tokio::time::sleep(self.config.warmup).await;
        tracing::info!(session_id = %self.id, model_id = %self.config.model_id, "Speech stream initialized");
        Ok(SessionTasks { reader, audio_pump })
    }

    /// Write one frame to the remote stream.
    ///
    /// A `sessionEnd` frame closes the session once it has been written.
    ///
    /// # Errors
    /// Returns `Error::SessionInactive` outside the `Active` state, or the
    /// transport error if the write fails.
    pub async fn send_event(&self, event: StreamEvent) -> Result<()> {
        self.send_atomic(std::slice::from_ref(&event)).await?;
        if event.ends_session() {
            self.close().await;
        }
        Ok(())
    }

    /// Write several frames back to back while holding the write lock.
    ///
    /// # Errors
    /// Returns `Error::SessionInactive` outside the `Active` state, or the
    /// first transport error.
    pub async fn send_atomic(&self, events: &[StreamEvent]) -> Result<()> {
        if !self.state.get().is_active() {
            tracing::warn!(session_id = %self.id, "Stream not initialized or closed");
            return Err(Error::SessionInactive);
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::SessionInactive)?;
        for event in events {
            self.check_audio_still_open(event)?;
            if let Err(err) = sink.send(event).await {
                tracing::error!(session_id = %self.id, event = event.name(), error = %err, "Error sending frame");
                if err.is_fatal() {
                    self.state.advance(SessionState::Error);
                }
                return Err(err);
            }
            if let Ok(mut content) = self.content.lock() {
                content.track(event);
            }
        }
        Ok(())
    }

    /// Audio whose content was closed while it sat in the queue must not reach
    /// the remote stream. Called with the write lock held.
    #[allow(clippy::result_large_err)]
    fn check_audio_still_open(&self, event: &StreamEvent) -> Result<()> {
        if event.kind() != &EventKind::AudioInput {
            return Ok(());
        }
        let content_name = event.fields_as::<AudioInput>()?.content_name.unwrap_or_default();
        if self.is_content_open(&content_name) {
            return Ok(());
        }
        tracing::warn!(session_id = %self.id, content_name = %content_name, "Dropping audio for closed content");
        Err(Error::InvalidClientEvent(format!("audio for content '{content_name}' which is not open")))
    }

    /// Queue audio without waiting.
    ///
    /// # Errors
    /// Returns `Error::InvalidClientEvent` if the content is not open,
    /// `Error::Backpressure` if the queue is full, and
    /// `Error::SessionInactive` once the pump has gone away.
    #[allow(clippy::result_large_err)]
    pub fn try_enqueue_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.check_audio_target(&chunk)?;
        self.audio_tx.try_send(PumpItem::Chunk(chunk)).map_err(|err| match err {
            TrySendError::Full(_) => Error::Backpressure,
            TrySendError::Closed(_) => Error::SessionInactive,
        })
    }

    /// Queue audio, waiting up to the configured timeout for queue space.
    ///
    /// # Errors
    /// As [`try_enqueue_audio`](Self::try_enqueue_audio), with
    /// `Error::Backpressure` only after the timeout elapses.
    pub async fn enqueue_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.check_audio_target(&chunk)?;
        self.audio_tx
            .send_timeout(PumpItem::Chunk(chunk), self.config.audio_enqueue_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => {
                    tracing::warn!(session_id = %self.id, "Audio queue full; dropping chunk");
                    Error::Backpressure
                }
                SendTimeoutError::Closed(_) => Error::SessionInactive,
            })
    }

    /// Wait until every chunk queued so far has been written or dropped.
    ///
    /// Returns early if the pump has gone away.
    pub async fn flush_audio(&self) {
        if !self.state.get().is_active() {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.audio_tx.send(PumpItem::Flush(done_tx)).await.is_err() {
            return;
        }
        let mut state_rx = self.state.subscribe();
        tokio::select! {
            _ = done_rx => {}
            () = state::inactive(&mut state_rx) => {}
        }
    }

    #[allow(clippy::result_large_err)]
    fn check_audio_target(&self, chunk: &AudioChunk) -> Result<()> {
        // incomplete chunks are left for the pump to skip
        if chunk.content_name.is_empty() || self.is_content_open(&chunk.content_name) {
            return Ok(());
        }
        Err(Error::InvalidClientEvent(format!(
            "audio for content '{}' which is not open",
            chunk.content_name
        )))
    }

    /// Close the write side of the remote stream. Idempotent.
    ///
    /// Background tasks are not cancelled here; they observe the state change
    /// and the owning connection reaps them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.id, "Closing speech stream");

        let was_new = self.state.get() == SessionState::New;
        self.state.advance(SessionState::Closing);
        if was_new {
            self.gate.release(Readiness::Failed("session closed before setup".to_string()));
        }

        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            match sink.close().await {
                Ok(()) => tracing::info!(session_id = %self.id, "Speech input stream closed"),
                Err(err) => {
                    tracing::warn!(session_id = %self.id, error = %err, "Ignoring error while closing speech stream");
                }
            }
        }
        drop(writer);
        self.state.advance(SessionState::Closed);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::audio::AudioPayload;
    use crate::bridge::tools::ToolRegistry;
    use crate::bridge::transport::{BoxFuture, FrameSource};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records frame names and stalls the first audio write until notified.
    struct GatedSink {
        sent: mpsc::UnboundedSender<String>,
        gate: Option<Arc<Notify>>,
    }

    impl FrameSink for GatedSink {
        fn send(&mut self, event: &StreamEvent) -> BoxFuture<'_, Result<()>> {
            let label = match event.kind() {
                EventKind::AudioInput => format!("audio:{}", event.fields()["content"].as_str().unwrap_or_default()),
                _ => event.name().to_string(),
            };
            let gate = if event.kind() == &EventKind::AudioInput { self.gate.take() } else { None };
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                self.sent.send(label).map_err(|_| Error::ConnectionClosed)
            })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move { self.sent.send("close".to_string()).map_err(|_| Error::ConnectionClosed) })
        }
    }

    struct IdleSource {
        _keep: mpsc::UnboundedSender<String>,
        frames: mpsc::UnboundedReceiver<String>,
    }

    impl FrameSource for IdleSource {
        fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
            Box::pin(async move { Ok(self.frames.recv().await) })
        }
    }

    struct OneShotConnector {
        sink: StdMutex<Option<GatedSink>>,
    }

    impl Connector for OneShotConnector {
        fn open<'a>(
            &'a self,
            _config: &'a BridgeConfig,
        ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>> {
            Box::pin(async move {
                let sink = self.sink.lock().unwrap().take().ok_or(Error::ConnectionClosed)?;
                let (keep, frames) = mpsc::unbounded_channel();
                let source = IdleSource { _keep: keep, frames };
                Ok((Box::new(sink) as Box<dyn FrameSink>, Box::new(source) as Box<dyn FrameSource>))
            })
        }
    }

    fn chunk(content: &str) -> AudioChunk {
        AudioChunk::new("p1", "a1", AudioPayload::Base64(content.to_string()))
    }

    /// An active session with audio content `a1` open and a stalled sink.
    async fn stalled_session() -> (Arc<SessionManager>, Arc<Notify>, mpsc::UnboundedReceiver<String>) {
        let config = BridgeConfig {
            audio_queue_capacity: 1,
            audio_enqueue_timeout: Duration::from_millis(20),
            warmup: Duration::ZERO,
            ..BridgeConfig::default()
        };
        let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::new()), Duration::from_secs(1));
        let (session, _output) = SessionManager::new(config, dispatcher);
        let gate = Arc::new(Notify::new());
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let connector = OneShotConnector {
            sink: StdMutex::new(Some(GatedSink { sent: sent_tx, gate: Some(Arc::clone(&gate)) })),
        };
        session.initialize(&connector).await.unwrap();

        session.send_event(StreamEvent::new("promptStart", json!({ "promptName": "p1" }))).await.unwrap();
        session
            .send_event(StreamEvent::new(
                "contentStart",
                json!({ "promptName": "p1", "contentName": "a1", "type": "AUDIO" }),
            ))
            .await
            .unwrap();
        assert_eq!(sent_rx.recv().await.unwrap(), "promptStart");
        assert_eq!(sent_rx.recv().await.unwrap(), "contentStart");
        (session, gate, sent_rx)
    }

    /// Wait until the pump has taken the first chunk and is stuck writing it.
    async fn wait_for_stalled_pump(session: &SessionManager) {
        for _ in 0..100 {
            if session.writer.try_lock().is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("audio pump never reached the sink");
    }

    #[tokio::test]
    async fn full_audio_queue_reports_backpressure() {
        let (session, gate, mut sent_rx) = stalled_session().await;

        session.enqueue_audio(chunk("AAAA")).await.unwrap();
        wait_for_stalled_pump(&session).await;
        session.enqueue_audio(chunk("BBBB")).await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(matches!(session.enqueue_audio(chunk("CCCC")).await, Err(Error::Backpressure)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(matches!(session.try_enqueue_audio(chunk("DDDD")), Err(Error::Backpressure)));

        gate.notify_one();
        assert_eq!(sent_rx.recv().await.unwrap(), "audio:AAAA");
        assert_eq!(sent_rx.recv().await.unwrap(), "audio:BBBB");
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn close_finishes_the_chunk_in_flight_and_drops_the_rest() {
        let (session, gate, mut sent_rx) = stalled_session().await;

        session.enqueue_audio(chunk("AAAA")).await.unwrap();
        wait_for_stalled_pump(&session).await;
        session.try_enqueue_audio(chunk("BBBB")).unwrap();

        let closing = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.close().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Closing);
        gate.notify_one();
        closing.await.unwrap();

        assert_eq!(sent_rx.recv().await.unwrap(), "audio:AAAA");
        assert_eq!(sent_rx.recv().await.unwrap(), "close");
        assert!(sent_rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn audio_for_content_closed_while_queued_is_dropped() {
        let (session, _gate, _sent_rx) = stalled_session().await;
        session.send_atomic(&[StreamEvent::content_end("p1", "a1")]).await.unwrap();
        let err = session.send_atomic(&[chunk("AAAA").to_event()]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidClientEvent(_)));
        assert_eq!(session.state(), SessionState::Active);
    }
}
