use super::tools::ToolRegistry;
use crate::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const DATE_FORMAT: &str = "%A, %Y-%m-%d %H-%M-%S";

/// Job profile fields exposed to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub profile_name: String,
    #[serde(default)]
    pub job_description: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub company_background: String,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn read_profile(&self, profile_id: &str) -> Result<Profile>;
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn session_transcription(&self, session_id: &str) -> Result<Value>;
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<String>;
}

#[async_trait]
pub trait LocationSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<String>;
}

/// Nested agent used for open questions and booking lookups.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn query(&self, input: &str) -> Result<String>;
    async fn invoke(&self, input: &str) -> Result<String>;
}

/// Backends for the built-in tools. Tools whose backend is absent are not
/// registered.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub profiles: Option<Arc<dyn ProfileStore>>,
    pub transcripts: Option<Arc<dyn TranscriptStore>>,
    pub knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    pub locations: Option<Arc<dyn LocationSearch>>,
    pub agent: Option<Arc<dyn AgentClient>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("profiles", &self.profiles.is_some())
            .field("transcripts", &self.transcripts.is_some())
            .field("knowledge_base", &self.knowledge_base.is_some())
            .field("locations", &self.locations.is_some())
            .field("agent", &self.agent.is_some())
            .finish()
    }
}

impl Collaborators {
    /// Use one backend for every collaborator role.
    #[must_use]
    pub fn all<T>(backend: Arc<T>) -> Self
    where
        T: ProfileStore + TranscriptStore + KnowledgeBase + LocationSearch + AgentClient + 'static,
    {
        Self {
            profiles: Some(backend.clone()),
            transcripts: Some(backend.clone()),
            knowledge_base: Some(backend.clone()),
            locations: Some(backend.clone()),
            agent: Some(backend),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ProfileArgs {
    /// Identifier of the job profile to read.
    profile_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SessionArgs {
    /// Identifier of the interview session.
    session_id: String,
}

/// Register the built-in tools backed by `collaborators`.
///
/// # Errors
/// Returns `Error::Config` if a built-in name is already taken.
#[allow(clippy::result_large_err)]
pub fn register_builtin_tools(registry: &mut ToolRegistry, collaborators: &Collaborators) -> Result<()> {
    registry.raw_tool("getDateTool", "Get the current UTC date and time.", |_content| async {
        Ok(Value::from(chrono::Utc::now().format(DATE_FORMAT).to_string()))
    })?;

    if let Some(kb) = collaborators.knowledge_base.clone() {
        registry.raw_tool("getKbTool", "Look up information in the knowledge base.", move |content| {
            let kb = Arc::clone(&kb);
            async move { Ok(Value::from(kb.retrieve(content.as_str()).await?)) }
        })?;
    }

    if let Some(locations) = collaborators.locations.clone() {
        registry.raw_tool("getLocationTool", "Search for places and addresses.", move |content| {
            let locations = Arc::clone(&locations);
            async move { Ok(Value::from(locations.search(content.as_str()).await?)) }
        })?;
    }

    if let Some(agent) = collaborators.agent.clone() {
        let query_agent = Arc::clone(&agent);
        registry.raw_tool("externalAgent", "Ask an external agent an open question.", move |content| {
            let agent = Arc::clone(&query_agent);
            async move { Ok(Value::from(agent.query(content.as_str()).await?)) }
        })?;

        registry.raw_tool("getBookingDetails", "Look up, create, or change bookings.", move |content| {
            let agent = Arc::clone(&agent);
            async move { Ok(Value::from(booking_details(agent.as_ref(), content.as_str()).await)) }
        })?;
    }

    if let Some(profiles) = collaborators.profiles.clone() {
        registry.tool("readProfile", "Read a job profile.", move |args: ProfileArgs| {
            let profiles = Arc::clone(&profiles);
            async move { profiles.read_profile(&args.profile_id).await }
        })?;
    }

    if let Some(transcripts) = collaborators.transcripts.clone() {
        registry.tool(
            "getSessionTranscription",
            "Read the full transcription of an interview session.",
            move |args: SessionArgs| {
                let transcripts = Arc::clone(&transcripts);
                async move { transcripts.session_transcription(&args.session_id).await }
            },
        )?;
    }

    Ok(())
}

/// Agent failures are reported to the model as the tool's answer.
async fn booking_details(agent: &dyn AgentClient, content: &str) -> String {
    match lookup_bookings(agent, content).await {
        Ok(answer) => answer,
        Err(err) => {
            tracing::warn!(error = %err, "Booking lookup failed");
            format!("Error processing booking details: {err}")
        }
    }
}

/// Invoke the agent and, when it answers with raw booking JSON, ask it again
/// to phrase the answer for the user.
async fn lookup_bookings(agent: &dyn AgentClient, content: &str) -> Result<String> {
    let answer = agent.invoke(content).await?;
    let has_bookings = serde_json::from_str::<Value>(&answer)
        .ok()
        .is_some_and(|value| value.get("bookings").is_some());
    if !has_bookings {
        return Ok(answer);
    }
    agent
        .invoke(&format!("Format this booking information for the user: {answer}"))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tools::ToolContent;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        invocations: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProfileStore for FakeBackend {
        async fn read_profile(&self, profile_id: &str) -> Result<Profile> {
            Ok(Profile { profile_name: format!("profile {profile_id}"), ..Profile::default() })
        }
    }

    #[async_trait]
    impl TranscriptStore for FakeBackend {
        async fn session_transcription(&self, session_id: &str) -> Result<Value> {
            Ok(serde_json::json!([{ "session": session_id }]))
        }
    }

    #[async_trait]
    impl KnowledgeBase for FakeBackend {
        async fn retrieve(&self, query: &str) -> Result<String> {
            Ok(format!("kb:{query}"))
        }
    }

    #[async_trait]
    impl LocationSearch for FakeBackend {
        async fn search(&self, query: &str) -> Result<String> {
            Ok(format!("near:{query}"))
        }
    }

    #[async_trait]
    impl AgentClient for FakeBackend {
        async fn query(&self, input: &str) -> Result<String> {
            Ok(format!("agent:{input}"))
        }

        async fn invoke(&self, input: &str) -> Result<String> {
            self.invocations.lock().unwrap().push(input.to_string());
            if input.starts_with("Format") {
                Ok("You have one booking.".to_string())
            } else {
                Ok(r#"{"bookings":[{"id":1}]}"#.to_string())
            }
        }
    }

    struct UnreachableAgent;

    #[async_trait]
    impl AgentClient for UnreachableAgent {
        async fn query(&self, _input: &str) -> Result<String> {
            Err(crate::Error::ConnectionClosed)
        }

        async fn invoke(&self, _input: &str) -> Result<String> {
            Err(crate::Error::ConnectionClosed)
        }
    }

    fn registry(collaborators: &Collaborators) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, collaborators).unwrap();
        registry
    }

    #[tokio::test]
    async fn date_tool_is_always_registered() {
        let registry = registry(&Collaborators::default());
        assert_eq!(registry.definitions().len(), 1);
        let value = registry.invoke("getdatetool", ToolContent::default()).unwrap().await.unwrap();
        let text = value.as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(text, DATE_FORMAT).is_ok(), "{text}");
    }

    #[tokio::test]
    async fn booking_json_is_reformatted() {
        let backend = Arc::new(FakeBackend::default());
        let registry = registry(&Collaborators::all(backend.clone()));
        let value = registry
            .invoke("getbookingdetails", ToolContent::new(r#"{"name":"x"}"#))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, Value::from("You have one booking."));
        assert_eq!(backend.invocations.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn profile_tool_takes_typed_arguments() {
        let registry = registry(&Collaborators::all(Arc::new(FakeBackend::default())));
        let value = registry
            .invoke("readprofile", ToolContent::new(r#"{"profile_id":"42"}"#))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value["profile_name"], "profile 42");
        assert!(registry.invoke("readprofile", ToolContent::new("{}")).unwrap().await.is_err());
    }

    #[tokio::test]
    async fn booking_failure_is_reported_as_the_answer() {
        let collaborators = Collaborators { agent: Some(Arc::new(UnreachableAgent)), ..Collaborators::default() };
        let registry = registry(&collaborators);
        let value = registry
            .invoke("getbookingdetails", ToolContent::new(r#"{"name":"x"}"#))
            .unwrap()
            .await
            .unwrap();
        let text = value.as_str().unwrap();
        assert!(text.starts_with("Error processing booking details: "), "{text}");
        assert!(registry.invoke("externalagent", ToolContent::default()).unwrap().await.is_err());
    }

    #[tokio::test]
    async fn location_tool_needs_a_backend() {
        assert!(registry(&Collaborators::default()).invoke("getlocationtool", ToolContent::default()).is_none());
        let registry = registry(&Collaborators::all(Arc::new(FakeBackend::default())));
        let value = registry
            .invoke("getlocationtool", ToolContent::new(r#"{"query":"coffee"}"#))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, Value::from(r#"near:{"query":"coffee"}"#));
    }
}
