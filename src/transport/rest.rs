use crate::bridge::builtin::{AgentClient, KnowledgeBase, LocationSearch, Profile, ProfileStore, TranscriptStore};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    text: String,
}

/// HTTP backend for the built-in tools.
///
/// Routes, relative to the base URL:
/// `GET profiles/{id}`, `GET sessions/{id}/transcript`,
/// `POST knowledge-base/retrieve`, `POST locations/search`, `POST agent/query`,
/// `POST agent/invoke`.
/// POST bodies and responses are `{"text": ...}`.
#[derive(Clone, Debug)]
pub struct RestCollaborators {
    client: Client,
    base_url: Url,
    auth_header: Option<HeaderValue>,
}

impl RestCollaborators {
    /// # Errors
    /// Returns an error if the token is not a valid header or the client fails to build.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: Url, token: Option<&str>) -> Result<Self> {
        Self::new_with_timeouts(base_url, token, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the token is not a valid header or the client fails to build.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        base_url: Url,
        token: Option<&str>,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        let auth_header = token
            .map(|token| HeaderValue::from_str(&format!("Bearer {token}")))
            .transpose()?;
        Ok(Self { client, base_url: with_trailing_slash(base_url), auth_header })
    }

    #[allow(clippy::result_large_err)]
    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(header) => request.header(AUTHORIZATION, header),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self
            .authorize(self.client.get(self.url(path)?))
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json().await?)
    }

    async fn post_text(&self, path: &str, text: &str) -> Result<String> {
        let res = self
            .authorize(self.client.post(self.url(path)?))
            .json(&TextRequest { text })
            .send()
            .await?
            .error_for_status()?;
        let body: TextResponse = res.json().await?;
        Ok(body.text)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn segment(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

#[async_trait]
impl ProfileStore for RestCollaborators {
    async fn read_profile(&self, profile_id: &str) -> Result<Profile> {
        self.get_json(&format!("profiles/{}", segment(profile_id))).await
    }
}

#[async_trait]
impl TranscriptStore for RestCollaborators {
    async fn session_transcription(&self, session_id: &str) -> Result<Value> {
        self.get_json(&format!("sessions/{}/transcript", segment(session_id))).await
    }
}

#[async_trait]
impl KnowledgeBase for RestCollaborators {
    async fn retrieve(&self, query: &str) -> Result<String> {
        self.post_text("knowledge-base/retrieve", query).await
    }
}

#[async_trait]
impl LocationSearch for RestCollaborators {
    async fn search(&self, query: &str) -> Result<String> {
        self.post_text("locations/search", query).await
    }
}

#[async_trait]
impl AgentClient for RestCollaborators {
    async fn query(&self, input: &str) -> Result<String> {
        self.post_text("agent/query", input).await
    }

    async fn invoke(&self, input: &str) -> Result<String> {
        self.post_text("agent/invoke", input).await
    }
}
