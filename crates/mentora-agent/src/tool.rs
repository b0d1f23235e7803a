//! Tool execution framework for the agent loop.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use mentora_provider::ToolDef;

/// The tool families a request may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Rag,
    WebSearch,
    McpTool,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Rag => "rag",
            ToolKind::WebSearch => "web_search",
            ToolKind::McpTool => "mcp_tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rag" => Some(ToolKind::Rag),
            "web_search" => Some(ToolKind::WebSearch),
            "mcp_tool" => Some(ToolKind::McpTool),
            _ => None,
        }
    }
}

/// Output from one tool execution. `content` goes to the synthesis
/// prompt; `payload` carries structured data surfaced in the API
/// response (retrieved spans, search hits).
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub payload: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            payload: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Per-turn context handed to tools: who is asking and what scope the
/// turn runs in.
#[derive(Clone)]
pub struct ToolTurnContext {
    pub owner_id: i64,
    pub conversation_id: i64,
    pub kb_ids: Vec<i64>,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn kind(&self) -> ToolKind;
    fn definition(&self) -> ToolDef;
    async fn execute(&self, input: serde_json::Value, ctx: &ToolTurnContext) -> Result<ToolOutput>;
}

/// Registry of the tools enabled for one turn.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn ToolExecutor>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn kind_of(&self, name: &str) -> Option<ToolKind> {
        self.tools.get(name).map(|t| t.kind())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool; failures become error outputs so the synthesis
    /// call can explain them instead of the turn aborting.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolTurnContext,
    ) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutput::error(format!("tool not found: {name}"));
        };
        match tool.execute(input, ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::error(format!("Tool execution error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        fn kind(&self) -> ToolKind {
            ToolKind::Rag
        }

        fn definition(&self) -> ToolDef {
            ToolDef {
                name: "echo".into(),
                description: "Echo input".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            }
        }

        async fn execute(
            &self,
            input: serde_json::Value,
            _ctx: &ToolTurnContext,
        ) -> Result<ToolOutput> {
            let text = input["text"].as_str().unwrap_or("").to_string();
            if text == "boom" {
                anyhow::bail!("induced tool failure");
            }
            Ok(ToolOutput::text(text))
        }
    }

    fn ctx() -> ToolTurnContext {
        ToolTurnContext {
            owner_id: 1,
            conversation_id: 1,
            kb_ids: vec![],
        }
    }

    #[tokio::test]
    async fn execute_known_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let out = registry
            .execute("echo", serde_json::json!({"text": "hello"}), &ctx())
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_output() {
        let registry = ToolRegistry::new();
        let out = registry.execute("ghost", serde_json::json!({}), &ctx()).await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let out = registry
            .execute("echo", serde_json::json!({"text": "boom"}), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("induced tool failure"));
    }

    #[test]
    fn kind_parse_roundtrip() {
        for kind in [ToolKind::Rag, ToolKind::WebSearch, ToolKind::McpTool] {
            assert_eq!(ToolKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ToolKind::parse("shell"), None);
    }
}
