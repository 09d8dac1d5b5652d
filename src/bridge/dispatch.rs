use super::session::SessionManager;
use super::tools::{ToolRegistry, ToolResult, ToolTurn};
use crate::protocol::StreamEvent;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Runs tool handlers and writes their results back into the remote stream.
#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    #[must_use]
    pub const fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the handler for `turn`. Never fails: unknown tools yield the
    /// neutral result and handler faults yield the generic failure result.
    pub async fn execute(&self, turn: &ToolTurn) -> ToolResult {
        match self.try_execute(turn).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(tool = %turn.tool_name, tool_use_id = %turn.tool_use_id, error = %err, "Tool failed");
                ToolResult::failure()
            }
        }
    }

    async fn try_execute(&self, turn: &ToolTurn) -> Result<ToolResult> {
        // the content must be valid JSON whenever it is present
        turn.content.json().map_err(|e| tool_fault(turn, &e))?;

        let Some(fut) = self.registry.invoke(&turn.tool_name, turn.content.clone()) else {
            tracing::info!(tool = %turn.tool_name, "No handler registered for tool");
            return Ok(ToolResult::no_result());
        };

        let mut handle = tokio::spawn(fut);
        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(ToolResult::new(value)),
            Ok(Ok(Err(err))) => Err(tool_fault(turn, &err)),
            Ok(Err(join_err)) => Err(tool_fault(turn, &join_err)),
            Err(_) => {
                handle.abort();
                Err(Error::ToolTimeout(turn.tool_name.clone()))
            }
        }
    }

    /// Execute `turn` and emit the start/result/end triple as one atomic
    /// write, so no other frame can land inside the tool turn.
    ///
    /// # Errors
    /// Returns an error if the frames cannot be written.
    pub async fn respond(&self, session: &SessionManager, prompt_name: &str, turn: &ToolTurn) -> Result<()> {
        tracing::info!(tool = %turn.tool_name, tool_use_id = %turn.tool_use_id, "Processing tool use");
        let result = self.execute(turn).await;
        let frames = result_frames(prompt_name, &turn.tool_use_id, &result);
        session.send_atomic(&frames).await
    }
}

/// The three frames that hand a tool result back to the model.
#[must_use]
pub fn result_frames(prompt_name: &str, tool_use_id: &str, result: &ToolResult) -> [StreamEvent; 3] {
    let content_name = format!("tool-content-{}", Uuid::new_v4());
    [
        StreamEvent::tool_content_start(prompt_name, &content_name, tool_use_id),
        StreamEvent::tool_result(prompt_name, &content_name, &result.to_json_string()),
        StreamEvent::content_end(prompt_name, &content_name),
    ]
}

fn tool_fault(turn: &ToolTurn, err: &dyn std::fmt::Display) -> Error {
    Error::Tool { tool: turn.tool_name.clone(), message: err.to_string() }
}
