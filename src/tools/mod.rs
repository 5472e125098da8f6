//! Capability contract and registry.
//!
//! Capabilities are looked up by stable name and invoked through one uniform
//! interface. An unknown name is a [`ToolError`], never a panic.

pub mod protocol;

pub use protocol::{ParsedResponse, ProtocolDiagnostic, describe_tools, parse_tool_call};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use crate::echo::Artifact;
use crate::errors::ToolError;

/// Writes a key into the attempt's state overlay.
pub const SET_STATE: &str = "set_state";
/// Records the routing decision of a multi-handoff phase.
pub const ROUTE_TO: &str = "route_to";

/// Names the turn executor handles itself.
pub const BUILTIN_CAPABILITIES: &[&str] = &[SET_STATE, ROUTE_TO];

/// Description of a capability as the model sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-schema object for the arguments.
    pub parameters: Value,
}

/// A capability call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider call id (native protocol only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            arguments,
        }
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub artifacts: Vec<Artifact>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// An externally implemented capability.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolError>;
}

/// Name-indexed capability registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous one.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.tools.insert(capability.name().to_string(), capability);
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Schemas for the named capabilities, built-ins included.
    ///
    /// `route_targets` populates the `route_to` schema; it is only offered
    /// when the phase has more than one handoff.
    pub fn schemas(&self, names: &[String], route_targets: &[String]) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = names
            .iter()
            .filter_map(|name| match name.as_str() {
                SET_STATE => Some(set_state_schema()),
                ROUTE_TO => None,
                _ => self.get(name).map(|tool| ToolSchema {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                }),
            })
            .collect();
        if route_targets.len() > 1 {
            schemas.push(route_to_schema(route_targets));
        }
        schemas
    }

    /// Invoke a registered capability with a per-call timeout.
    pub async fn invoke(&self, call: &ToolCall, timeout: Duration) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownCapability(call.name.clone()))?;

        if !call.arguments.is_object() {
            return Err(ToolError::InvalidArguments {
                tool: call.name.clone(),
                message: "arguments must be a JSON object".into(),
            });
        }

        match tokio::time::timeout(timeout, tool.invoke(call.arguments.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

fn set_state_schema() -> ToolSchema {
    ToolSchema {
        name: SET_STATE.into(),
        description: "Store a value in the shared workflow state for later phases.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {}
            },
            "required": ["key", "value"]
        }),
    }
}

fn route_to_schema(targets: &[String]) -> ToolSchema {
    ToolSchema {
        name: ROUTE_TO.into(),
        description: "Choose which phase runs next.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string", "enum": targets}
            },
            "required": ["target"]
        }),
    }
}
