use crate::protocol::events::{ContentStart, GenerationStage, Role, TextOutput};
use crate::protocol::{EventKind, StreamEvent};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl TranscriptRole {
    const fn from_role(role: Role) -> Option<Self> {
        match role {
            Role::User => Some(Self::User),
            Role::Assistant => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
    /// Offset from the start of the session.
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Conversation text as the client heard it.
///
/// Built from the output stream: user text and final assistant text are kept,
/// speculative assistant text and barge-in markers are not.
#[derive(Debug, Clone)]
pub struct Transcript {
    started: Instant,
    role: Option<Role>,
    speculative: bool,
    entries: Vec<TranscriptEntry>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self { started: Instant::now(), role: None, speculative: false, entries: Vec::new() }
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event.kind() {
            EventKind::ContentStart => {
                if let Ok(start) = event.fields_as::<ContentStart>() {
                    self.role = start.role;
                    self.speculative = start.generation_stage() == Some(GenerationStage::Speculative);
                }
            }
            EventKind::TextOutput => {
                if event.is_barge_in() {
                    return;
                }
                let Ok(text) = event.fields_as::<TextOutput>() else { return };
                let Some(role) = text.role.or(self.role).and_then(TranscriptRole::from_role) else {
                    return;
                };
                if role == TranscriptRole::Assistant && self.speculative {
                    return;
                }
                if text.content.is_empty() {
                    return;
                }
                self.entries.push(TranscriptEntry {
                    role,
                    content: text.content,
                    elapsed: self.started.elapsed(),
                });
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Plain-text rendering, one `ROLE: text` line per entry.
    #[must_use]
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                let who = match entry.role {
                    TranscriptRole::User => "USER",
                    TranscriptRole::Assistant => "ASSISTANT",
                };
                format!("{who}: {}", entry.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_start(role: &str, stage: Option<&str>) -> StreamEvent {
        let mut fields = json!({ "role": role, "type": "TEXT", "contentName": "c" });
        if let Some(stage) = stage {
            fields["additionalModelFields"] = json!(format!(r#"{{"generationStage":"{stage}"}}"#));
        }
        StreamEvent::new("contentStart", fields)
    }

    fn text(content: &str) -> StreamEvent {
        StreamEvent::new("textOutput", json!({ "content": content }))
    }

    #[test]
    fn keeps_user_and_final_assistant_text() {
        let mut transcript = Transcript::new();
        transcript.observe(&content_start("USER", None));
        transcript.observe(&text("what time is it"));
        transcript.observe(&content_start("ASSISTANT", Some("SPECULATIVE")));
        transcript.observe(&text("it is probably noon"));
        transcript.observe(&content_start("ASSISTANT", Some("FINAL")));
        transcript.observe(&text("it is noon"));

        let roles: Vec<_> = transcript.entries().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![TranscriptRole::User, TranscriptRole::Assistant]);
        assert_eq!(transcript.render(), "USER: what time is it\nASSISTANT: it is noon");
    }

    #[test]
    fn barge_in_marker_is_not_transcribed() {
        let mut transcript = Transcript::new();
        transcript.observe(&content_start("ASSISTANT", Some("FINAL")));
        transcript.observe(&text(r#"{ "interrupted" : true }"#));
        assert!(transcript.entries().is_empty());
    }

    #[test]
    fn entries_serialize_with_millis() {
        let entry = TranscriptEntry {
            role: TranscriptRole::User,
            content: "hi".to_string(),
            elapsed: Duration::from_millis(1500),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value, json!({ "role": "user", "content": "hi", "elapsed_ms": 1500 }));
    }
}
