use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mentora_provider::ToolDef;

use crate::tool::{ToolExecutor, ToolKind, ToolOutput, ToolTurnContext};

const MCP_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote tool exposed over HTTP at a user-configured endpoint with a
/// declared JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolConfig {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    pub input_schema: serde_json::Value,
}

pub struct McpTool {
    config: McpToolConfig,
    client: reqwest::Client,
}

impl McpTool {
    pub fn new(config: McpToolConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(MCP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

/// Boundary validation of an opaque tool payload against the tool's
/// declared schema: required keys must be present on an object input.
fn validate_against_schema(input: &serde_json::Value, schema: &serde_json::Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") {
        let Some(obj) = input.as_object() else {
            return Err("input must be a JSON object".into());
        };
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(format!("missing required field '{key}'"));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ToolExecutor for McpTool {
    fn kind(&self) -> ToolKind {
        ToolKind::McpTool
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            input_schema: self.config.input_schema.clone(),
        }
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolTurnContext) -> Result<ToolOutput> {
        if let Err(reason) = validate_against_schema(&input, &self.config.input_schema) {
            return Ok(ToolOutput::error(format!("invalid tool input: {reason}")));
        }

        let response = match self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&input)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolOutput::error(format!("MCP call failed: {e}")));
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(ToolOutput::error(format!(
                "MCP endpoint returned HTTP {status}: {body}"
            )));
        }

        let payload: serde_json::Value =
            serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body.clone()));
        Ok(ToolOutput::text(payload.to_string()).with_payload(payload))
    }
}
