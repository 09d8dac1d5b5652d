use crate::{Error, Result};
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = Arc<dyn Fn(ToolContent) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Result text used when no handler produced anything.
pub const NO_RESULT: &str = "no result found";

/// Result text used when a handler failed.
pub const TOOL_FAILURE: &str =
    "An error occurred while attempting to retrieve information related to the toolUse event.";

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<RootSchema>,
}

/// Opaque tool input as the model sent it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolContent(String);

impl ToolContent {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Decode the content as JSON, treating empty content as `{}`.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if the content is not valid JSON.
    #[allow(clippy::result_large_err)]
    pub fn json(&self) -> Result<Value> {
        if self.is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&self.0)?)
    }

    /// # Errors
    /// Returns `Error::Serialization` if the content does not decode into `T`.
    #[allow(clippy::result_large_err)]
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.json()?)?)
    }
}

/// Context for one tool round trip, from `toolUse` to the matching `contentEnd`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolTurn {
    pub tool_name: String,
    pub tool_use_id: String,
    pub content: ToolContent,
    /// Content id of the `toolUse` block, used to match its `contentEnd`.
    pub content_id: Option<String>,
}

/// Value sent back to the model, always shaped `{"result": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResult {
    pub result: Value,
}

impl ToolResult {
    #[must_use]
    pub fn new(result: Value) -> Self {
        let result = match result {
            Value::Null => Value::from(NO_RESULT),
            Value::String(s) if s.is_empty() => Value::from(NO_RESULT),
            other => other,
        };
        Self { result }
    }

    #[must_use]
    pub fn no_result() -> Self {
        Self { result: Value::from(NO_RESULT) }
    }

    #[must_use]
    pub fn failure() -> Self {
        Self { result: Value::from(TOOL_FAILURE) }
    }

    #[must_use]
    pub fn to_json_string(&self) -> String {
        json!({ "result": self.result }).to_string()
    }
}

/// Static registry of named tool handlers, keyed case-insensitively.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    defs: Vec<ToolDefinition>,
    handlers: BTreeMap<String, ToolHandler>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("defs", &self.defs).finish_non_exhaustive()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_lowercase())
    }

    /// Register a tool whose content is decoded into `TArgs`.
    ///
    /// # Errors
    /// Returns `Error::Config` if the name is empty or already registered.
    #[allow(clippy::result_large_err)]
    pub fn tool<TArgs, TResp, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let schema = schemars::schema_for!(TArgs);
        let user_handler = Arc::new(handler);
        let handler: ToolHandler = Arc::new(move |content: ToolContent| -> BoxFuture<Result<Value>> {
            let user_handler = Arc::clone(&user_handler);
            Box::pin(async move {
                let args: TArgs = content.parse()?;
                let resp = user_handler(args).await?;
                Ok(serde_json::to_value(resp)?)
            })
        });
        self.insert(name, Some(description.into()), Some(schema), handler)
    }

    /// Register a tool that receives the opaque content string.
    ///
    /// # Errors
    /// Returns `Error::Config` if the name is empty or already registered.
    #[allow(clippy::result_large_err)]
    pub fn raw_tool<F, Fut>(&mut self, name: &str, description: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(ToolContent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: ToolHandler =
            Arc::new(move |content: ToolContent| -> BoxFuture<Result<Value>> { Box::pin(handler(content)) });
        self.insert(name, Some(description.into()), None, handler)
    }

    #[allow(clippy::result_large_err)]
    fn insert(
        &mut self,
        name: &str,
        description: Option<String>,
        schema: Option<RootSchema>,
        handler: ToolHandler,
    ) -> Result<()> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Err(Error::Config("tool name must not be empty".to_string()));
        }
        if self.handlers.contains_key(&key) {
            return Err(Error::Config(format!("tool '{name}' registered twice")));
        }
        self.defs.push(ToolDefinition { name: name.trim().to_string(), description, schema });
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Start a handler invocation. `None` if no tool matches `name`.
    pub(crate) fn invoke(&self, name: &str, content: ToolContent) -> Option<BoxFuture<Result<Value>>> {
        let handler = self.handlers.get(&name.to_lowercase())?;
        Some(handler(content))
    }

    /// Tool configuration block for a `promptStart` frame.
    ///
    /// # Errors
    /// Returns an error if a schema fails to serialize.
    #[allow(clippy::result_large_err)]
    pub fn tool_configuration(&self) -> Result<Value> {
        let mut tools = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let schema = match &def.schema {
                Some(schema) => serde_json::to_string(schema)?,
                None => json!({ "type": "object", "properties": {} }).to_string(),
            };
            tools.push(json!({
                "toolSpec": {
                    "name": def.name,
                    "description": def.description.clone().unwrap_or_default(),
                    "inputSchema": { "json": schema },
                }
            }));
        }
        Ok(json!({ "tools": tools }))
    }
}
