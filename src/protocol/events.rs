use crate::error::{ServiceError, ServiceErrorKind};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Key under which the receipt time (unix millis) is stamped onto a frame.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Text payload the service emits when the user talks over the assistant.
const BARGE_IN_KEY: &str = "interrupted";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStart,
    PromptStart,
    ContentStart,
    AudioInput,
    TextInput,
    ToolResult,
    ContentEnd,
    PromptEnd,
    SessionEnd,
    CompletionStart,
    TextOutput,
    AudioOutput,
    ToolUse,
    CompletionEnd,
    UsageEvent,
    Other(String),
}

impl EventKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "sessionStart" => Self::SessionStart,
            "promptStart" => Self::PromptStart,
            "contentStart" => Self::ContentStart,
            "audioInput" => Self::AudioInput,
            "textInput" => Self::TextInput,
            "toolResult" => Self::ToolResult,
            "contentEnd" => Self::ContentEnd,
            "promptEnd" => Self::PromptEnd,
            "sessionEnd" => Self::SessionEnd,
            "completionStart" => Self::CompletionStart,
            "textOutput" => Self::TextOutput,
            "audioOutput" => Self::AudioOutput,
            "toolUse" => Self::ToolUse,
            "completionEnd" => Self::CompletionEnd,
            "usageEvent" => Self::UsageEvent,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionStart => "sessionStart",
            Self::PromptStart => "promptStart",
            Self::ContentStart => "contentStart",
            Self::AudioInput => "audioInput",
            Self::TextInput => "textInput",
            Self::ToolResult => "toolResult",
            Self::ContentEnd => "contentEnd",
            Self::PromptEnd => "promptEnd",
            Self::SessionEnd => "sessionEnd",
            Self::CompletionStart => "completionStart",
            Self::TextOutput => "textOutput",
            Self::AudioOutput => "audioOutput",
            Self::ToolUse => "toolUse",
            Self::CompletionEnd => "completionEnd",
            Self::UsageEvent => "usageEvent",
            Self::Other(name) => name,
        }
    }
}

/// One frame in the `{"event": {"<name>": {...}}}` envelope.
///
/// The envelope is kept as decoded so that forwarding is lossless; typed views
/// over the inner fields are available through [`StreamEvent::fields_as`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    envelope: Map<String, Value>,
    kind: EventKind,
}

impl StreamEvent {
    #[must_use]
    pub fn new(name: &str, fields: Value) -> Self {
        let mut inner = Map::new();
        inner.insert(name.to_string(), fields);
        let mut envelope = Map::new();
        envelope.insert("event".to_string(), Value::Object(inner));
        Self { envelope, kind: EventKind::from_name(name) }
    }

    /// Decode a raw frame.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if the text is not JSON, and
    /// `Error::InvalidClientEvent` if it is JSON but not an object.
    #[allow(clippy::result_large_err)]
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// # Errors
    /// Returns `Error::InvalidClientEvent` if the value is not a JSON object.
    #[allow(clippy::result_large_err)]
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(envelope) = value else {
            return Err(Error::InvalidClientEvent("frame is not a JSON object".to_string()));
        };
        let kind = envelope
            .get("event")
            .and_then(Value::as_object)
            .and_then(|inner| inner.keys().next())
            .map_or_else(|| EventKind::Other(String::new()), |name| EventKind::from_name(name));
        Ok(Self { envelope, kind })
    }

    #[must_use]
    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.kind.as_str()
    }

    /// Fields of the single named event, or `Value::Null` when absent.
    #[must_use]
    pub fn fields(&self) -> &Value {
        self.envelope
            .get("event")
            .and_then(|inner| inner.get(self.kind.as_str()))
            .unwrap_or(&Value::Null)
    }

    /// Deserialize the event fields into a typed view.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if the fields do not match `T`.
    #[allow(clippy::result_large_err)]
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(self.fields())?)
    }

    #[must_use]
    pub fn is_envelope(&self) -> bool {
        self.envelope.get("event").is_some_and(Value::is_object)
    }

    /// Stamp the receipt time in unix milliseconds.
    pub fn stamp(&mut self, millis: i64) {
        self.envelope.insert(TIMESTAMP_KEY.to_string(), Value::from(millis));
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.envelope.get(TIMESTAMP_KEY).and_then(Value::as_i64)
    }

    /// A service exception carried at the top level of the frame, if any.
    #[must_use]
    pub fn service_error(&self) -> Option<ServiceError> {
        ServiceErrorKind::FRAME_KEYS.iter().find_map(|key| {
            self.envelope.get(*key).map(|body| ServiceError {
                kind: ServiceErrorKind::from_frame_key(key),
                message: body
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| body.to_string(), str::to_string),
            })
        })
    }

    /// Whether this frame semantically ends the session.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        self.kind == EventKind::SessionEnd
    }

    /// Whether this is a text output carrying the barge-in sentinel.
    #[must_use]
    pub fn is_barge_in(&self) -> bool {
        if self.kind != EventKind::TextOutput {
            return false;
        }
        self.fields()
            .get("content")
            .and_then(Value::as_str)
            .and_then(|text| serde_json::from_str::<Value>(text).ok())
            .and_then(|value| value.get(BARGE_IN_KEY).and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// Mutable access to the named event fields.
    pub(crate) fn fields_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let name = self.kind.as_str().to_string();
        self.envelope
            .get_mut("event")
            .and_then(|inner| inner.get_mut(&name))
            .and_then(Value::as_object_mut)
    }

    /// # Errors
    /// Returns `Error::Serialization` if encoding fails.
    #[allow(clippy::result_large_err)]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.envelope)?)
    }

    #[must_use]
    pub fn audio_input(prompt_name: &str, content_name: &str, content: &str) -> Self {
        Self::new(
            "audioInput",
            json!({
                "promptName": prompt_name,
                "contentName": content_name,
                "content": content,
            }),
        )
    }

    #[must_use]
    pub fn tool_content_start(prompt_name: &str, content_name: &str, tool_use_id: &str) -> Self {
        Self::new(
            "contentStart",
            json!({
                "promptName": prompt_name,
                "contentName": content_name,
                "interactive": false,
                "type": "TOOL",
                "role": "TOOL",
                "toolResultInputConfiguration": {
                    "toolUseId": tool_use_id,
                    "type": "TEXT",
                    "textInputConfiguration": { "mediaType": "text/plain" },
                },
            }),
        )
    }

    #[must_use]
    pub fn tool_result(prompt_name: &str, content_name: &str, content: &str) -> Self {
        Self::new(
            "toolResult",
            json!({
                "promptName": prompt_name,
                "contentName": content_name,
                "content": content,
            }),
        )
    }

    #[must_use]
    pub fn content_end(prompt_name: &str, content_name: &str) -> Self {
        Self::new(
            "contentEnd",
            json!({
                "promptName": prompt_name,
                "contentName": content_name,
            }),
        )
    }

    #[must_use]
    pub fn session_end() -> Self {
        Self::new("sessionEnd", json!({}))
    }
}

impl Serialize for StreamEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.envelope.serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Audio,
    Text,
    Tool,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStage {
    Speculative,
    Final,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: Option<String>,
    pub content_name: Option<String>,
    pub content_id: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
    pub role: Option<Role>,
    /// JSON-encoded string, e.g. `{"generationStage":"SPECULATIVE"}`.
    pub additional_model_fields: Option<String>,
}

impl ContentStart {
    #[must_use]
    pub fn generation_stage(&self) -> Option<GenerationStage> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Extra {
            generation_stage: Option<GenerationStage>,
        }

        let raw = self.additional_model_fields.as_deref()?;
        serde_json::from_str::<Extra>(raw).ok()?.generation_stage
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEnd {
    pub prompt_name: Option<String>,
    pub content_name: Option<String>,
    pub content_id: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_use_id: String,
    /// Opaque payload, usually a JSON-encoded string.
    pub content: Option<String>,
    pub content_id: Option<String>,
    pub prompt_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    #[serde(default)]
    pub content: String,
    pub role: Option<Role>,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInput {
    pub prompt_name: Option<String>,
    pub content_name: Option<String>,
    pub content: Option<String>,
}

/// Prompt/content names carried by most inbound frames.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Names {
    pub prompt_name: Option<String>,
    pub content_name: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_classifies_by_event_name() {
        let evt = StreamEvent::decode(r#"{"event":{"toolUse":{"toolName":"getDateTool","toolUseId":"t1"}}}"#)
            .unwrap();
        assert_eq!(evt.kind(), &EventKind::ToolUse);
        let tool: ToolUse = evt.fields_as().unwrap();
        assert_eq!(tool.tool_name, "getDateTool");
        assert_eq!(tool.tool_use_id, "t1");
        assert!(tool.content.is_none());
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = StreamEvent::decode("not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn stamp_is_serialized_alongside_event() {
        let mut evt = StreamEvent::content_end("p1", "c1");
        evt.stamp(1_700_000_000_000);
        let value: Value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(value["event"]["contentEnd"]["promptName"], "p1");
        assert_eq!(evt.timestamp(), Some(1_700_000_000_000));
    }

    #[test]
    fn generation_stage_is_read_from_additional_fields() {
        let evt = StreamEvent::new(
            "contentStart",
            json!({
                "role": "ASSISTANT",
                "type": "TEXT",
                "additionalModelFields": "{\"generationStage\":\"SPECULATIVE\"}",
            }),
        );
        let start: ContentStart = evt.fields_as().unwrap();
        assert_eq!(start.role, Some(Role::Assistant));
        assert_eq!(start.content_type, Some(ContentType::Text));
        assert_eq!(start.generation_stage(), Some(GenerationStage::Speculative));
    }

    #[test]
    fn barge_in_sentinel_is_detected() {
        let evt = StreamEvent::new("textOutput", json!({ "content": "{ \"interrupted\" : true }" }));
        assert!(evt.is_barge_in());
        let plain = StreamEvent::new("textOutput", json!({ "content": "hello" }));
        assert!(!plain.is_barge_in());
    }

    #[test]
    fn service_error_frames_are_recognized() {
        let evt = StreamEvent::decode(r#"{"validationException":{"message":"bad input"}}"#).unwrap();
        let err = evt.service_error().expect("service error");
        assert_eq!(err.kind, ServiceErrorKind::ValidationException);
        assert_eq!(err.message, "bad input");
        assert!(!evt.is_envelope());
    }

    #[test]
    fn unknown_event_names_are_kept() {
        let evt = StreamEvent::new("somethingNew", json!({}));
        assert_eq!(evt.kind(), &EventKind::Other("somethingNew".to_string()));
        assert_eq!(evt.name(), "somethingNew");
    }
}
