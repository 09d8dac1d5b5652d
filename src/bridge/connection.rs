use super::audio::{AudioChunk, AudioPayload};
use super::dispatch::ToolDispatcher;
use super::output::{ClientSink, run_forwarder};
use super::session::{SessionManager, SessionTasks};
use super::tools::ToolRegistry;
use super::transcript::{Transcript, TranscriptEntry};
use super::transport::Connector;
use crate::config::BridgeConfig;
use crate::protocol::events::AudioInput;
use crate::protocol::{ClientFrame, EventKind, StreamEvent};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// One client connection bridged to one remote session.
///
/// The session is created lazily on the first client frame. Every exit path
/// (client disconnect, remote end of stream, fatal fault, failed setup)
/// funnels into a single teardown that runs exactly once.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    tools: Arc<ToolRegistry>,
    client: Arc<dyn ClientSink>,
    init_lock: Mutex<()>,
    session: StdMutex<Option<Arc<SessionManager>>>,
    tasks: StdMutex<Option<SessionTasks>>,
    forwarder: StdMutex<Option<JoinHandle<()>>>,
    transcript: Arc<StdMutex<Transcript>>,
    torn_down: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
        tools: Arc<ToolRegistry>,
        client: Arc<dyn ClientSink>,
    ) -> Self {
        let (closed_tx, _closed_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                tools,
                client,
                init_lock: Mutex::new(()),
                session: StdMutex::new(None),
                tasks: StdMutex::new(None),
                forwarder: StdMutex::new(None),
                transcript: Arc::new(StdMutex::new(Transcript::new())),
                torn_down: AtomicBool::new(false),
                closed_tx,
            }),
        }
    }

    /// The session, once the first client frame has created it.
    #[must_use]
    pub fn session(&self) -> Option<Arc<SessionManager>> {
        self.inner.session.lock().ok().and_then(|slot| slot.clone())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Snapshot of the transcript so far.
    #[must_use]
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner
            .transcript
            .lock()
            .map(|t| t.entries().to_vec())
            .unwrap_or_default()
    }

    /// Handle one text frame from the client.
    ///
    /// # Errors
    /// Returns `Error::InvalidClientEvent` or `Error::Serialization` for frames
    /// that cannot be accepted, the setup fault if the session fails to start,
    /// and `Error::SessionInactive` once the connection has been torn down.
    pub async fn handle_client_frame(&self, text: &str) -> Result<()> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(Error::SessionInactive);
        }
        let frame = ClientFrame::parse(text)?;
        let session = self.ensure_session().await?;

        let mut event = frame.into_event();
        match event.kind() {
            EventKind::AudioInput => {
                let audio: AudioInput = event.fields_as()?;
                let chunk = AudioChunk::new(
                    audio.prompt_name.unwrap_or_default(),
                    audio.content_name.unwrap_or_default(),
                    AudioPayload::Base64(audio.content.unwrap_or_default()),
                );
                session.enqueue_audio(chunk).await
            }
            EventKind::PromptStart => {
                self.inject_tool_configuration(&mut event)?;
                session.send_event(event).await
            }
            EventKind::ContentEnd | EventKind::PromptEnd | EventKind::SessionEnd => {
                // queued audio goes out before the content it belongs to is closed
                session.flush_audio().await;
                session.send_event(event).await
            }
            _ => session.send_event(event).await,
        }
    }

    /// Disconnect the client and tear everything down. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    #[allow(clippy::result_large_err)]
    fn inject_tool_configuration(&self, event: &mut StreamEvent) -> Result<()> {
        if self.inner.tools.is_empty() {
            return Ok(());
        }
        let Some(fields) = event.fields_mut() else {
            return Ok(());
        };
        if !fields.contains_key("toolConfiguration") {
            fields.insert("toolConfiguration".to_string(), self.inner.tools.tool_configuration()?);
            tracing::debug!(tools = self.inner.tools.definitions().len(), "Injected tool configuration");
        }
        if !fields.contains_key("toolUseOutputConfiguration") {
            fields.insert(
                "toolUseOutputConfiguration".to_string(),
                serde_json::json!({ "mediaType": "application/json" }),
            );
        }
        Ok(())
    }

    async fn ensure_session(&self) -> Result<Arc<SessionManager>> {
        let _guard = self.inner.init_lock.lock().await;
        if let Some(session) = self.session() {
            return Ok(session);
        }

        let dispatcher = ToolDispatcher::new(Arc::clone(&self.inner.tools), self.inner.config.tool_timeout);
        let (session, output_rx) = SessionManager::new(self.inner.config.clone(), dispatcher);
        if let Ok(mut slot) = self.inner.session.lock() {
            *slot = Some(Arc::clone(&session));
        }

        // the forwarder starts first so a setup failure still reaches the client
        let inner = Arc::clone(&self.inner);
        let forwarder = tokio::spawn(
            async move {
                run_forwarder(output_rx, Arc::clone(&inner.client), Arc::clone(&inner.transcript)).await;
                // teardown awaits this task, so it must run elsewhere
                tokio::spawn(async move { inner.teardown().await });
            }
            .instrument(tracing::info_span!("s2s_forwarder", session_id = %session.id())),
        );
        if let Ok(mut slot) = self.inner.forwarder.lock() {
            *slot = Some(forwarder);
        }

        let tasks = session.initialize(self.inner.connector.as_ref()).await?;
        if let Ok(mut slot) = self.inner.tasks.lock() {
            *slot = Some(tasks);
        }
        if self.inner.torn_down.load(Ordering::SeqCst) {
            // the stream ended during warm-up and teardown already ran
            if let Some(tasks) = self.inner.tasks.lock().ok().and_then(|mut slot| slot.take()) {
                tasks.reader.abort();
                tasks.audio_pump.abort();
            }
        }
        Ok(session)
    }
}

impl Inner {
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Tearing down connection");
        let grace = self.config.teardown_grace;

        let session = self.session.lock().ok().and_then(|slot| slot.clone());
        if let Some(session) = session {
            if tokio::time::timeout(grace, session.close()).await.is_err() {
                tracing::warn!(session_id = %session.id(), "Session close timed out");
            }
        }

        let tasks = self.tasks.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tasks) = tasks {
            reap("reader", tasks.reader, grace).await;
            reap("audio_pump", tasks.audio_pump, grace).await;
        }
        let forwarder = self.forwarder.lock().ok().and_then(|mut slot| slot.take());
        if let Some(forwarder) = forwarder {
            reap("forwarder", forwarder, grace).await;
        }

        self.client.close().await;
        self.closed_tx.send_replace(true);
        tracing::info!("Connection closed");
    }
}

/// Wait for a task to finish, aborting it once `grace` has passed.
async fn reap(task: &str, mut handle: JoinHandle<()>, grace: Duration) {
    let joined = match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::debug!(task, "Task still running after grace period; aborting");
            handle.abort();
            handle.await
        }
    };
    // cancellation is the expected way out for aborted tasks
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!(task, error = %err, "Task panicked");
        }
    }
}
