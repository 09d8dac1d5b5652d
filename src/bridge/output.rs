use super::transcript::Transcript;
use super::transport::BoxFuture;
use crate::protocol::StreamEvent;
use crate::{Error, Result};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// One item on the way from the remote stream to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    /// A decoded remote event, stamped on receipt.
    Event(StreamEvent),
    /// A frame that was not JSON, passed through verbatim.
    Raw(String),
    /// A fault the client should hear about before the stream ends.
    Error(String),
}

impl OutputItem {
    /// Render the item as a client frame.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if an event fails to encode.
    #[allow(clippy::result_large_err)]
    pub fn to_client_json(&self) -> Result<String> {
        match self {
            Self::Event(event) => event.to_json(),
            Self::Raw(text) => Ok(json!({ "raw_data": text }).to_string()),
            Self::Error(message) => Ok(json!({ "error": message }).to_string()),
        }
    }
}

/// The client connection the bridge forwards output to.
pub trait ClientSink: Send + Sync {
    fn send(&self, frame: String) -> BoxFuture<'_, Result<()>>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Forward output items to the client until the queue closes.
///
/// The queue drops its oldest items when the client falls behind; a lagging
/// forwarder logs the loss and keeps going.
pub(crate) async fn run_forwarder(
    mut rx: broadcast::Receiver<OutputItem>,
    client: Arc<dyn ClientSink>,
    transcript: Arc<Mutex<Transcript>>,
) {
    loop {
        let item = match rx.recv().await {
            Ok(item) => item,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Client output lagging; oldest items dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let OutputItem::Event(event) = &item {
            if event.is_barge_in() {
                tracing::debug!("Barge-in passed through to client");
            }
            if let Ok(mut transcript) = transcript.lock() {
                transcript.observe(event);
            }
        }

        let frame = match item.to_client_json() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode output item");
                continue;
            }
        };
        match client.send(frame).await {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => {
                tracing::info!("Client connection closed; forwarder stopping");
                break;
            }
            Err(err) => tracing::warn!(error = %err, "Failed to send to client"),
        }
    }
    tracing::debug!("Forwarder exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[derive(Default)]
    struct Recording {
        frames: Mutex<Vec<String>>,
    }

    impl ClientSink for Recording {
        fn send(&self, frame: String) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.frames.lock().unwrap().push(frame);
                Ok(())
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    #[test]
    fn items_render_as_client_frames() {
        let raw = OutputItem::Raw("not json".to_string()).to_client_json().unwrap();
        assert_eq!(raw, r#"{"raw_data":"not json"}"#);
        let err = OutputItem::Error("boom".to_string()).to_client_json().unwrap();
        assert_eq!(err, r#"{"error":"boom"}"#);
    }

    #[tokio::test]
    async fn forwarder_passes_events_unmodified_and_stops_on_close() {
        let (tx, rx) = broadcast::channel(8);
        let client = Arc::new(Recording::default());
        let transcript = Arc::new(Mutex::new(Transcript::new()));

        let mut event = StreamEvent::decode(r#"{"event":{"textOutput":{"content":"{ \"interrupted\" : true }"}}}"#).unwrap();
        event.stamp(42);
        tx.send(OutputItem::Event(event)).unwrap();
        tx.send(OutputItem::Raw("x".to_string())).unwrap();
        drop(tx);

        run_forwarder(rx, client.clone(), transcript.clone()).await;

        let frames = client.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["timestamp"], 42);
        assert_eq!(first["event"]["textOutput"]["content"], "{ \"interrupted\" : true }");
        assert!(transcript.lock().unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn lagging_forwarder_keeps_newest_items() {
        let (tx, rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(OutputItem::Raw(i.to_string())).unwrap();
        }
        drop(tx);
        let client = Arc::new(Recording::default());
        run_forwarder(rx, client.clone(), Arc::new(Mutex::new(Transcript::new()))).await;
        let frames = client.frames.lock().unwrap().clone();
        assert_eq!(frames, vec![r#"{"raw_data":"3"}"#.to_string(), r#"{"raw_data":"4"}"#.to_string()]);
    }
}
