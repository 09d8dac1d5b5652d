use super::builtin::{Collaborators, register_builtin_tools};
use super::connection::Connection;
use super::output::ClientSink;
use super::tools::ToolRegistry;
use super::transport::{Connector, WsConnector};
use crate::config::BridgeConfig;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct BridgeBuilder {
    config: BridgeConfig,
    tools: ToolRegistry,
    collaborators: Option<Collaborators>,
    connector: Arc<dyn Connector>,
}

impl BridgeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Start from configuration read from the environment.
    ///
    /// # Errors
    /// Returns `Error::Config` if an environment variable is malformed.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_config(BridgeConfig::from_env()?))
    }

    #[must_use]
    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            config,
            tools: ToolRegistry::new(),
            collaborators: None,
            connector: Arc::new(WsConnector),
        }
    }

    #[must_use]
    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.config.model_id = model_id.into();
        self
    }

    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.config.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.config.authorization = Some(value.into());
        self
    }

    #[must_use]
    pub const fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = timeout;
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Register the built-in tools on top of `tools` at build time.
    #[must_use]
    pub fn builtin_tools(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Build a connection that forwards output to `client`.
    ///
    /// # Errors
    /// Returns `Error::Config` if the configuration is invalid or a tool name
    /// is registered twice.
    #[allow(clippy::result_large_err)]
    pub fn build(self, client: Arc<dyn ClientSink>) -> Result<Connection> {
        self.config.validate()?;
        let mut tools = self.tools;
        if let Some(collaborators) = &self.collaborators {
            register_builtin_tools(&mut tools, collaborators)?;
        }
        tracing::debug!(model_id = %self.config.model_id, tools = tools.definitions().len(), "Bridge configured");
        Ok(Connection::new(self.config, self.connector, Arc::new(tools), client))
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
