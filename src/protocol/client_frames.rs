use super::events::{EventKind, StreamEvent};
use crate::{Error, Result};

/// Event names a client may send through the bridge.
pub const INBOUND_EVENTS: [&str; 8] = [
    "sessionStart",
    "promptStart",
    "contentStart",
    "audioInput",
    "textInput",
    "contentEnd",
    "promptEnd",
    "sessionEnd",
];

/// A validated inbound client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    event: StreamEvent,
}

impl ClientFrame {
    /// Decode and validate one client text frame.
    ///
    /// # Errors
    /// Returns `Error::Serialization` for non-JSON input and
    /// `Error::InvalidClientEvent` for envelopes that are missing or carry an
    /// event name the bridge does not accept.
    #[allow(clippy::result_large_err)]
    pub fn parse(text: &str) -> Result<Self> {
        let event = StreamEvent::decode(text)?;
        Self::try_from(event)
    }

    #[must_use]
    pub const fn kind(&self) -> &EventKind {
        self.event.kind()
    }

    #[must_use]
    pub const fn event(&self) -> &StreamEvent {
        &self.event
    }

    #[must_use]
    pub fn into_event(self) -> StreamEvent {
        self.event
    }
}

impl TryFrom<StreamEvent> for ClientFrame {
    type Error = Error;

    fn try_from(event: StreamEvent) -> Result<Self> {
        if !event.is_envelope() {
            return Err(Error::InvalidClientEvent("missing `event` envelope".to_string()));
        }
        if !INBOUND_EVENTS.contains(&event.name()) {
            return Err(Error::InvalidClientEvent(format!(
                "unsupported client event '{}'",
                event.name()
            )));
        }
        if !event.fields().is_object() {
            return Err(Error::InvalidClientEvent(format!(
                "'{}' fields must be an object",
                event.name()
            )));
        }
        Ok(Self { event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_recognized_names() {
        let frame = ClientFrame::parse(r#"{"event":{"promptStart":{"promptName":"p1"}}}"#).unwrap();
        assert_eq!(frame.kind(), &EventKind::PromptStart);
    }

    #[test]
    fn rejects_server_only_events() {
        let err = ClientFrame::parse(r#"{"event":{"toolUse":{}}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidClientEvent(msg) if msg.contains("toolUse")));
    }

    #[test]
    fn rejects_missing_envelope() {
        let err = ClientFrame::parse(r#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidClientEvent(_)));
    }

    #[test]
    fn rejects_scalar_fields() {
        let err = ClientFrame::parse(r#"{"event":{"audioInput":"abc"}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidClientEvent(msg) if msg.contains("object")));
    }
}
