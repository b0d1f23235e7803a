use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use mentora_provider::{EmbeddingProvider, RerankProvider, ToolDef};
use mentora_retrieval::{RetrievalEngine, RetrievalScope};

use crate::tool::{ToolExecutor, ToolKind, ToolOutput, ToolTurnContext};

/// Knowledge retrieval over the caller's selected knowledge bases plus
/// the conversation's temporary files.
pub struct RagTool {
    engine: RetrievalEngine,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn RerankProvider>,
}

impl RagTool {
    pub fn new(
        engine: RetrievalEngine,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn RerankProvider>,
    ) -> Self {
        Self {
            engine,
            embedder,
            reranker,
        }
    }
}

#[async_trait]
impl ToolExecutor for RagTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Rag
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "rag".into(),
            description:
                "Search the user's knowledge bases and attached files for passages relevant to a query. \
                 Use this when the question may be answered by the user's own documents."
                    .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolTurnContext) -> Result<ToolOutput> {
        let query = input["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Ok(ToolOutput::error("missing 'query' field"));
        }

        let scope = RetrievalScope {
            kb_ids: Some(ctx.kb_ids.clone()),
            conversation_id: Some(ctx.conversation_id),
        };
        let outcome = self
            .engine
            .retrieve(
                ctx.owner_id,
                &query,
                &scope,
                self.embedder.as_ref(),
                self.reranker.as_ref(),
            )
            .await?;

        if outcome.spans.is_empty() {
            let reason = outcome
                .reason
                .unwrap_or_else(|| "no relevant passages found".into());
            return Ok(ToolOutput::text(format!("No results: {reason}")));
        }

        let mut content = format!("Retrieved {} passage(s):\n\n", outcome.spans.len());
        for (i, span) in outcome.spans.iter().enumerate() {
            content.push_str(&format!(
                "[{}] (document {}, score {:.3})\n{}\n\n",
                i + 1,
                span.document_id,
                span.score,
                span.text.trim()
            ));
        }

        let payload = serde_json::to_value(&outcome.spans)?;
        Ok(ToolOutput::text(content).with_payload(payload))
    }
}
