use crate::{Error, Result};
use std::time::Duration;
use url::Url;

pub const DEFAULT_MODEL_ID: &str = "amazon.nova-sonic-v1:0";
pub const DEFAULT_REGION: &str = "us-east-1";

const DEFAULT_AUDIO_QUEUE_CAPACITY: usize = 256;
const DEFAULT_OUTPUT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_AUDIO_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_WARMUP: Duration = Duration::from_millis(200);
const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_millis(250);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_AUDIO_CHUNK_BYTES: usize = 1024 * 1024;

/// Settings for one bridged session and the tasks it spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub model_id: String,
    pub region: String,
    /// Overrides the endpoint derived from `region` and `model_id`.
    pub endpoint: Option<Url>,
    /// Sent verbatim as the `Authorization` header when present.
    pub authorization: Option<String>,
    pub audio_queue_capacity: usize,
    pub output_queue_capacity: usize,
    pub audio_enqueue_timeout: Duration,
    pub warmup: Duration,
    pub teardown_grace: Duration,
    pub tool_timeout: Duration,
    pub max_audio_chunk_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            authorization: None,
            audio_queue_capacity: DEFAULT_AUDIO_QUEUE_CAPACITY,
            output_queue_capacity: DEFAULT_OUTPUT_QUEUE_CAPACITY,
            audio_enqueue_timeout: DEFAULT_AUDIO_ENQUEUE_TIMEOUT,
            warmup: DEFAULT_WARMUP,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_audio_chunk_bytes: DEFAULT_MAX_AUDIO_CHUNK_BYTES,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    /// Returns `Error::Config` if a variable is present but malformed.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(model_id) = lookup("S2S_MODEL_ID") {
            config.model_id = model_id;
        }
        if let Some(region) = lookup("AWS_REGION") {
            config.region = region;
        }
        if let Some(endpoint) = lookup("S2S_ENDPOINT") {
            let url = Url::parse(&endpoint)
                .map_err(|e| Error::Config(format!("S2S_ENDPOINT: {e}")))?;
            config.endpoint = Some(url);
        }
        config.authorization = lookup("S2S_AUTHORIZATION");

        if let Some(value) = lookup("S2S_AUDIO_QUEUE") {
            config.audio_queue_capacity = parse_var("S2S_AUDIO_QUEUE", &value)?;
        }
        if let Some(value) = lookup("S2S_OUTPUT_QUEUE") {
            config.output_queue_capacity = parse_var("S2S_OUTPUT_QUEUE", &value)?;
        }
        if let Some(value) = lookup("S2S_TOOL_TIMEOUT_MS") {
            config.tool_timeout = Duration::from_millis(parse_var("S2S_TOOL_TIMEOUT_MS", &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `Error::Config` for empty identifiers or zero-sized queues.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(Error::Config("model id must not be empty".to_string()));
        }
        if self.region.trim().is_empty() {
            return Err(Error::Config("region must not be empty".to_string()));
        }
        if self.audio_queue_capacity == 0 || self.output_queue_capacity == 0 {
            return Err(Error::Config("queue capacities must be positive".to_string()));
        }
        Ok(())
    }

    /// Endpoint the remote stream connects to.
    ///
    /// # Errors
    /// Returns an error if the derived endpoint is not a valid URL.
    #[allow(clippy::result_large_err)]
    pub fn endpoint_url(&self) -> Result<Url> {
        if let Some(url) = &self.endpoint {
            return Ok(url.clone());
        }
        let mut url = Url::parse(&format!(
            "wss://bedrock-runtime.{}.amazonaws.com/model/",
            self.region
        ))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config("endpoint cannot be a base".to_string()))?
            .pop_if_empty()
            .push(&self.model_id)
            .push("invoke-with-bidirectional-stream");
        Ok(url)
    }
}

#[allow(clippy::result_large_err)]
fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| Error::Config(format!("{key}: '{value}' ({e})")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let config = BridgeConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
    }

    #[test]
    fn reads_overrides() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("AWS_REGION", "eu-north-1"),
            ("S2S_AUDIO_QUEUE", "8"),
            ("S2S_TOOL_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.region, "eu-north-1");
        assert_eq!(config.audio_queue_capacity, 8);
        assert_eq!(config.tool_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("S2S_OUTPUT_QUEUE", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("S2S_OUTPUT_QUEUE")));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("S2S_AUDIO_QUEUE", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn endpoint_derived_from_region_and_model() {
        let config = BridgeConfig::default();
        let url = config.endpoint_url().unwrap();
        assert_eq!(url.host_str(), Some("bedrock-runtime.us-east-1.amazonaws.com"));
        assert!(url.path().ends_with("/invoke-with-bidirectional-stream"));
        assert!(url.path().contains("amazon.nova-sonic-v1"));
    }
}
