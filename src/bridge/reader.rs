use super::output::OutputItem;
use super::session::SessionManager;
use super::state::{self, Readiness, SessionState};
use super::tools::{ToolContent, ToolTurn};
use super::transport::FrameSource;
use crate::protocol::events::{ContentEnd, ContentType, ToolUse};
use crate::protocol::{EventKind, StreamEvent};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Tool turns opened by `toolUse` and not yet closed by a TOOL `contentEnd`.
#[derive(Debug, Default)]
struct PendingTools {
    turns: VecDeque<ToolTurn>,
}

impl PendingTools {
    /// Unanswered turns beyond this are dropped oldest first.
    const MAX_OPEN: usize = 32;

    fn open(&mut self, turn: ToolTurn) {
        if self.turns.len() >= Self::MAX_OPEN {
            if let Some(stale) = self.turns.pop_front() {
                tracing::warn!(tool = %stale.tool_name, tool_use_id = %stale.tool_use_id, "Dropping unanswered tool turn");
            }
        }
        self.turns.push_back(turn);
    }

    /// Take the turn whose content id matches. Turns that never carried a
    /// content id are answered oldest first.
    fn take(&mut self, content_id: Option<&str>) -> Option<ToolTurn> {
        let Some(id) = content_id else {
            return self.turns.pop_front();
        };
        let pos = self
            .turns
            .iter()
            .position(|turn| turn.content_id.as_deref() == Some(id))
            .or_else(|| self.turns.iter().position(|turn| turn.content_id.is_none()))?;
        self.turns.remove(pos)
    }
}

/// Releases the readiness gate and records how the reader ended, on every
/// exit path including cancellation. Owns the output sender, so the output
/// queue closes once the reader is gone.
struct ReaderExit {
    session: Arc<SessionManager>,
    output: broadcast::Sender<OutputItem>,
    fault: Option<String>,
}

impl ReaderExit {
    fn forward(&self, item: OutputItem) {
        // no receiver just means the client side is already gone
        let _ = self.output.send(item);
    }

    fn fail(&mut self, err: &Error) {
        self.forward(OutputItem::Error(err.to_string()));
        self.fault = Some(err.to_string());
    }
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        match self.fault.take() {
            Some(reason) => {
                self.session.mark(SessionState::Error);
                self.session.readiness().release(Readiness::Failed(reason));
            }
            None => {
                self.session.mark(SessionState::Closing);
                self.session.readiness().release(Readiness::Ended);
            }
        }
        tracing::debug!("Reader exited");
    }
}

/// Read frames from the remote stream until it ends, faults, or the session
/// stops being active.
pub(crate) async fn run_reader(
    session: Arc<SessionManager>,
    mut source: Box<dyn FrameSource>,
    output: broadcast::Sender<OutputItem>,
) {
    let mut state_rx = session.state_receiver();
    let mut exit = ReaderExit { session: Arc::clone(&session), output, fault: None };
    let mut pending = PendingTools::default();

    loop {
        let frame = tokio::select! {
            biased;
            () = state::inactive(&mut state_rx) => {
                tracing::debug!("Session no longer active; reader stopping");
                break;
            }
            frame = source.next_frame() => frame,
        };

        match frame {
            Ok(Some(text)) => {
                if let Err(err) = handle_frame(&session, &exit, &mut pending, text).await {
                    if err.is_fatal() {
                        tracing::error!(error = %err, "Fatal error from speech stream");
                        exit.fail(&err);
                        break;
                    }
                    tracing::warn!(error = %err, "Recoverable error from speech stream");
                }
            }
            Ok(None) => {
                tracing::info!("Speech stream ended");
                break;
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "Speech stream transport failed");
                exit.fail(&err);
                break;
            }
            Err(err) => tracing::warn!(error = %err, "Error reading from speech stream"),
        }
    }

    if !pending.turns.is_empty() {
        tracing::warn!(count = pending.turns.len(), "Reader exited with unanswered tool turns");
    }
}

async fn handle_frame(
    session: &SessionManager,
    exit: &ReaderExit,
    pending: &mut PendingTools,
    text: String,
) -> Result<()> {
    let mut event = match StreamEvent::decode(&text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "Forwarding undecodable frame as raw data");
            exit.forward(OutputItem::Raw(text));
            return Ok(());
        }
    };
    event.stamp(chrono::Utc::now().timestamp_millis());

    if let Some(service_error) = event.service_error() {
        exit.forward(OutputItem::Event(event));
        return Err(Error::from_service(service_error));
    }

    let outcome = match event.kind() {
        EventKind::ToolUse => {
            open_tool_turn(&event, pending);
            Ok(())
        }
        EventKind::ContentEnd => answer_tool_turn(session, &event, pending).await,
        _ => Ok(()),
    };

    exit.forward(OutputItem::Event(event));
    outcome
}

fn open_tool_turn(event: &StreamEvent, pending: &mut PendingTools) {
    match event.fields_as::<ToolUse>() {
        Ok(tool_use) if !tool_use.tool_name.is_empty() => {
            tracing::info!(tool = %tool_use.tool_name, tool_use_id = %tool_use.tool_use_id, "Tool use requested");
            pending.open(ToolTurn {
                tool_name: tool_use.tool_name,
                tool_use_id: tool_use.tool_use_id,
                content: ToolContent::new(tool_use.content.unwrap_or_default()),
                content_id: tool_use.content_id,
            });
        }
        Ok(_) => tracing::warn!("toolUse without a tool name ignored"),
        Err(err) => tracing::warn!(error = %err, "Malformed toolUse ignored"),
    }
}

async fn answer_tool_turn(session: &SessionManager, event: &StreamEvent, pending: &mut PendingTools) -> Result<()> {
    let end = match event.fields_as::<ContentEnd>() {
        Ok(end) => end,
        Err(err) => {
            tracing::warn!(error = %err, "Malformed contentEnd");
            return Ok(());
        }
    };
    if end.content_type != Some(ContentType::Tool) {
        return Ok(());
    }

    let Some(turn) = pending.take(end.content_id.as_deref()) else {
        tracing::warn!(content_id = ?end.content_id, "TOOL contentEnd without a matching toolUse");
        return Ok(());
    };
    let Some(prompt_name) = end.prompt_name.or_else(|| session.prompt_name()) else {
        tracing::warn!(tool = %turn.tool_name, "No prompt name for tool result; dropping turn");
        return Ok(());
    };

    session.dispatcher().respond(session, &prompt_name, &turn).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: &str, content_id: Option<&str>) -> ToolTurn {
        ToolTurn {
            tool_name: "t".to_string(),
            tool_use_id: id.to_string(),
            content: ToolContent::default(),
            content_id: content_id.map(str::to_string),
        }
    }

    #[test]
    fn pending_turns_match_by_content_id() {
        let mut pending = PendingTools::default();
        pending.open(turn("u1", Some("c1")));
        pending.open(turn("u2", Some("c2")));
        assert_eq!(pending.take(Some("c2")).unwrap().tool_use_id, "u2");
        assert!(pending.take(Some("zz")).is_none());
        assert_eq!(pending.take(None).unwrap().tool_use_id, "u1");
        assert!(pending.take(None).is_none());

        pending.open(turn("u3", Some("c3")));
        pending.open(turn("u4", None));
        assert_eq!(pending.take(Some("zz")).unwrap().tool_use_id, "u4");
    }

    #[test]
    fn unanswered_turns_are_capped() {
        let mut pending = PendingTools::default();
        for i in 0..=PendingTools::MAX_OPEN {
            pending.open(turn(&format!("u{i}"), None));
        }
        assert_eq!(pending.turns.len(), PendingTools::MAX_OPEN);
        assert_eq!(pending.take(None).unwrap().tool_use_id, "u1");
    }
}
