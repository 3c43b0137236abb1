use serde::{Deserialize, Serialize};

/// A capability offered by one provider.
///
/// The schema is passed through to the provider untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as advertised by the provider.
    pub name: String,
    /// Name of the provider that owns the tool.
    pub provider: String,
    /// Free-form description shown to the agent.
    #[serde(default)]
    pub description: String,
    /// Invocation schema, opaque to muster.
    #[serde(default = "default_schema")]
    pub schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDescriptor {
    /// Creates a descriptor with an empty object schema.
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            description: description.into(),
            schema: default_schema(),
        }
    }

    /// Replaces the invocation schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }
}
