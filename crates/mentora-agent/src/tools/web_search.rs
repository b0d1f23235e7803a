use anyhow::Result;
use async_trait::async_trait;

use mentora_provider::{ToolDef, WebSearchProvider};

use crate::tool::{ToolExecutor, ToolKind, ToolOutput, ToolTurnContext};

const DEFAULT_COUNT: u64 = 5;

/// Web search through the tenant's configured search engine.
pub struct WebSearchTool {
    provider: Box<dyn WebSearchProvider>,
}

impl WebSearchTool {
    pub fn new(provider: Box<dyn WebSearchProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ToolExecutor for WebSearchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::WebSearch
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "web_search".into(),
            description: "Search the public web. Returns titles, URLs and snippets of relevant pages. \
                          Use this for current events or facts outside the user's documents."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    },
                    "count": {
                        "type": "integer",
                        "description": "Number of results (1-10, default 5)",
                        "minimum": 1,
                        "maximum": 10
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolTurnContext) -> Result<ToolOutput> {
        let query = input["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Ok(ToolOutput::error("missing 'query' field"));
        }
        let count = input["count"].as_u64().unwrap_or(DEFAULT_COUNT).clamp(1, 10) as usize;

        let hits = match self.provider.search(&query, count).await {
            Ok(hits) => hits,
            Err(e) => {
                return Ok(ToolOutput::error(format!("Search failed: {e}")));
            }
        };

        if hits.is_empty() {
            return Ok(ToolOutput::text(format!("No results found for: {query}")));
        }

        let mut content = format!("Search results for: {query}\n\n");
        for (i, hit) in hits.iter().enumerate() {
            content.push_str(&format!("{}. {}\n   {}\n   {}\n", i + 1, hit.title, hit.url, hit.snippet));
            if let Some(published) = &hit.published {
                content.push_str(&format!("   Published: {published}\n"));
            }
            content.push('\n');
        }

        let payload = serde_json::to_value(&hits)?;
        Ok(ToolOutput::text(content).with_payload(payload))
    }
}
