//! Per-turn agent orchestration: tool planning, context synthesis, and
//! transactional turn persistence.

pub mod title;
pub mod tool;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use mentora_blob::{make_key, BlobStore};
use mentora_ingest::{validate_upload, IngestionPipeline, UploadKind};
use mentora_points::{amounts, reasons};
use mentora_provider::{
    ChatMessage, ChatProvider, ChatRequest, ProviderError, ProviderGateway, ToolCallRequest,
};
use mentora_retrieval::RetrievalEngine;
use mentora_schema::{
    blob_prefix, AppError, ConversationMessage, MessageRole, NewMessage, PointKind, ProviderType,
    RetrievedSpan, SearchHit, UserCredential,
};
use mentora_store::{ConversationRepo, Database, KnowledgeRepo, UserRepo};

pub use tool::{ToolKind, ToolOutput, ToolRegistry, ToolTurnContext};
pub use tools::{McpTool, McpToolConfig, RagTool, WebSearchTool};

/// Credential precedence for chat calls.
const CHAT_PROVIDER_ORDER: &[ProviderType] = &[
    ProviderType::OpenAI,
    ProviderType::SiliconFlow,
    ProviderType::Zhipu,
    ProviderType::ModelScope,
    ProviderType::Custom,
];

const SYSTEM_PROMPT: &str = "You are a study assistant on a collaborative learning platform. \
    Answer grounded in the provided context when tools supply it, and say so when you are unsure.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Chat prefix length (most recent messages, oldest first).
    pub history_limit: i64,
    /// How long an agent turn waits for an attached file to ingest.
    pub attachment_wait: Duration,
    pub attachment_poll: Duration,
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            attachment_wait: Duration::from_secs(5),
            attachment_poll: Duration::from_secs(1),
            max_tokens: 2048,
        }
    }
}

/// Active web-search engine configuration for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEngineSettings {
    pub engine: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferredTools {
    All,
    Selected(Vec<String>),
}

impl Default for PreferredTools {
    fn default() -> Self {
        PreferredTools::All
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// One agent turn's input.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub user_id: i64,
    pub query: String,
    pub conversation_id: Option<i64>,
    pub kb_ids: Vec<i64>,
    pub use_tools: bool,
    pub preferred_tools: PreferredTools,
    pub llm_model_id: Option<String>,
    pub attachment: Option<AttachmentUpload>,
}

impl AgentRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.query.trim().is_empty() {
            return Err(AppError::bad_request("query must not be empty"));
        }
        if let PreferredTools::Selected(names) = &self.preferred_tools {
            for name in names {
                if ToolKind::parse(name).is_none() {
                    return Err(AppError::bad_request(format!("unknown tool: {name}")));
                }
            }
        }
        Ok(())
    }
}

/// One agent turn's output.
#[derive(Debug, Clone, Serialize)]
pub struct AgentAnswer {
    pub answer: String,
    pub answer_mode: String,
    pub llm_type_used: String,
    pub llm_model_used: String,
    pub conversation_id: i64,
    pub turn_messages: Vec<ConversationMessage>,
    pub source_articles: Vec<RetrievedSpan>,
    pub search_results: Vec<SearchHit>,
}

struct ExecutedTool {
    call: ToolCallRequest,
    kind: Option<ToolKind>,
    content: String,
    is_error: bool,
    payload: Option<serde_json::Value>,
}

pub struct AgentLoop {
    users: UserRepo,
    conversations: ConversationRepo,
    knowledge: KnowledgeRepo,
    retrieval: RetrievalEngine,
    gateway: ProviderGateway,
    pipeline: Arc<IngestionPipeline>,
    blob: Arc<dyn BlobStore>,
    search: Option<SearchEngineSettings>,
    mcp_tools: Vec<McpToolConfig>,
    config: AgentConfig,
    chat_override: Option<Arc<dyn ChatProvider>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        gateway: ProviderGateway,
        pipeline: Arc<IngestionPipeline>,
        blob: Arc<dyn BlobStore>,
        search: Option<SearchEngineSettings>,
        mcp_tools: Vec<McpToolConfig>,
        config: AgentConfig,
    ) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            knowledge: KnowledgeRepo::new(db.clone()),
            retrieval: RetrievalEngine::new(db),
            gateway,
            pipeline,
            blob,
            search,
            mcp_tools,
            config,
            chat_override: None,
        }
    }

    /// Substitute the chat provider (tests, offline mode).
    pub fn with_chat_override(mut self, chat: Arc<dyn ChatProvider>) -> Self {
        self.chat_override = Some(chat);
        self
    }

    /// Run one agent turn end to end. On synthesis failure nothing is
    /// persisted; the conversation is unchanged.
    pub async fn invoke(&self, request: AgentRequest) -> Result<AgentAnswer, AppError> {
        request.validate()?;
        let user_id = request.user_id;
        if self.users.get(user_id).await?.is_none() {
            return Err(AppError::Unauthenticated("unknown user".into()));
        }

        // 1. Resolve the conversation and its chat prefix.
        let (conversation_id, first_exchange) = match request.conversation_id {
            Some(id) => {
                let convo = self
                    .conversations
                    .get_owned(id, user_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("conversation not found"))?;
                (convo.id, false)
            }
            None => (self.conversations.create(user_id).await?.id, true),
        };
        let history = self
            .conversations
            .recent_messages(conversation_id, self.config.history_limit)
            .await?;

        // 2. Resolve the chat credential and model.
        let (chat, model, llm_type) = self.chat_for(user_id, request.llm_model_id.as_deref()).await?;

        // 3. Attachment: enqueue ingestion, wait briefly, proceed
        //    regardless of outcome.
        if let Some(upload) = &request.attachment {
            self.ingest_attachment(conversation_id, user_id, upload).await?;
        }

        // 4. Tool selection.
        let kb_ids = self
            .knowledge
            .accessible_kb_ids(user_id, request.kb_ids.clone())
            .await?;
        let registry = self.build_registry(&request, user_id).await?;
        let ctx = ToolTurnContext {
            owner_id: user_id,
            conversation_id,
            kb_ids,
        };

        // 5–6. Planner call, tool execution, synthesis call.
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        for m in &history {
            messages.push(ChatMessage {
                role: m.role.as_str().to_string(),
                content: Some(m.content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.push(ChatMessage::user(request.query.clone()));

        let mut executed: Vec<ExecutedTool> = Vec::new();
        let answer = if registry.is_empty() {
            let mut req = ChatRequest::new(model.clone(), messages.clone());
            req.max_tokens = Some(self.config.max_tokens);
            chat.chat(req).await.map_err(AppError::from)?.content
        } else {
            let mut planner_req =
                ChatRequest::new(model.clone(), messages.clone()).with_tools(registry.tool_defs());
            planner_req.max_tokens = Some(self.config.max_tokens);
            let planner = chat.chat(planner_req).await.map_err(AppError::from)?;

            if planner.tool_calls.is_empty() {
                planner.content
            } else {
                // Tools run sequentially; a failure becomes the tool
                // output so synthesis can explain it.
                for call in planner.tool_calls {
                    let output = registry.execute(&call.name, call.arguments.clone(), &ctx).await;
                    executed.push(ExecutedTool {
                        kind: registry.kind_of(&call.name),
                        content: output.content,
                        is_error: output.is_error,
                        payload: output.payload,
                        call,
                    });
                }

                let mut synth_messages = messages.clone();
                synth_messages.push(ChatMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: executed.iter().map(|e| e.call.clone()).collect(),
                    tool_call_id: None,
                });
                for e in &executed {
                    synth_messages.push(ChatMessage::tool_result(e.call.id.clone(), e.content.clone()));
                }

                let mut synth_req = ChatRequest::new(model.clone(), synth_messages);
                synth_req.max_tokens = Some(self.config.max_tokens);
                chat.chat(synth_req).await.map_err(AppError::from)?.content
            }
        };

        // 7. Persist the whole turn in one transaction, with the points
        //    and achievement hook staged on the same transaction.
        let mut turn = vec![NewMessage::text(MessageRole::User, request.query.clone())];
        for e in &executed {
            turn.push(NewMessage {
                role: MessageRole::Assistant,
                content: String::new(),
                tool_calls: Some(serde_json::json!({
                    "id": e.call.id,
                    "name": e.call.name,
                    "arguments": e.call.arguments,
                })),
                tool_output: None,
                llm_type_used: None,
                llm_model_used: None,
            });
            turn.push(NewMessage {
                role: MessageRole::Tool,
                content: e.content.clone(),
                tool_calls: None,
                tool_output: Some(serde_json::json!({
                    "tool": e.call.name,
                    "is_error": e.is_error,
                    "payload": e.payload,
                })),
                llm_type_used: None,
                llm_model_used: None,
            });
        }
        turn.push(NewMessage {
            role: MessageRole::Assistant,
            content: answer.clone(),
            tool_calls: None,
            tool_output: None,
            llm_type_used: Some(llm_type.clone()),
            llm_model_used: Some(model.clone()),
        });

        let turn_messages = self
            .conversations
            .append_turn_with(conversation_id, turn, move |tx| {
                mentora_points::award_points(
                    tx,
                    user_id,
                    amounts::CHAT_MESSAGE,
                    reasons::CHAT_MESSAGE,
                    PointKind::Earn,
                    Some("ai_conversation"),
                    Some(conversation_id),
                )?;
                // Achievement failures are logged and swallowed so the
                // turn itself still commits.
                if let Err(e) = mentora_points::check_and_award_achievements(tx, user_id) {
                    tracing::warn!(user_id, error = %e, "achievement check failed");
                }
                Ok(())
            })
            .await?;

        // 8. Title generation for the first exchange; failures are
        //    swallowed.
        if first_exchange && turn_messages.len() >= 2 {
            match title::generate_title(chat.as_ref(), &model, &request.query, &answer).await {
                Ok(generated) => {
                    if let Err(e) = self
                        .conversations
                        .set_title_if_absent(conversation_id, &generated)
                        .await
                    {
                        tracing::warn!(conversation_id, error = %e, "title write failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(conversation_id, error = %e, "title generation failed");
                }
            }
        }

        let (source_articles, search_results) = collect_tool_payloads(&executed);
        Ok(AgentAnswer {
            answer,
            answer_mode: answer_mode(&executed),
            llm_type_used: llm_type,
            llm_model_used: model,
            conversation_id,
            turn_messages,
            source_articles,
            search_results,
        })
    }

    async fn chat_for(
        &self,
        user_id: i64,
        model_override: Option<&str>,
    ) -> Result<(Arc<dyn ChatProvider>, String, String), AppError> {
        if let Some(chat) = &self.chat_override {
            let model = model_override
                .map(str::to_owned)
                .unwrap_or_else(|| self.gateway.defaults.chat_model.clone());
            return Ok((Arc::clone(chat), model, "stub".to_string()));
        }

        let creds = self.users.credentials(user_id).await?;
        let picked = pick_chat_credential(&creds);
        let (chat, model, llm_type) = self
            .gateway
            .chat_provider(picked, model_override)
            .map_err(AppError::from)?;
        Ok((Arc::from(chat), model, llm_type.to_string()))
    }

    async fn ingest_attachment(
        &self,
        conversation_id: i64,
        user_id: i64,
        upload: &AttachmentUpload,
    ) -> Result<(), AppError> {
        validate_upload(&upload.file_name, &upload.mime, &upload.bytes, UploadKind::ChatAttachment)?;

        let key = make_key(blob_prefix::AI_CHAT_TEMP_FILES, &upload.file_name);
        self.blob
            .upload(&key, &upload.bytes, &upload.mime)
            .await
            .map_err(|e| AppError::Internal(format!("attachment upload failed: {e}")))?;

        let file = self
            .conversations
            .create_temp_file(conversation_id, user_id, &upload.file_name, &key, &upload.mime)
            .await?;
        self.pipeline.spawn_temp_file(file.id);

        // Bounded wait; the turn proceeds whether or not ingestion
        // finished.
        let deadline = tokio::time::Instant::now() + self.config.attachment_wait;
        loop {
            tokio::time::sleep(self.config.attachment_poll).await;
            let current = self.conversations.get_temp_file(file.id).await?;
            if current.map(|f| f.status.is_terminal()).unwrap_or(true) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(temp_file_id = file.id, "attachment still processing after wait budget");
                break;
            }
        }
        Ok(())
    }

    async fn build_registry(
        &self,
        request: &AgentRequest,
        user_id: i64,
    ) -> Result<ToolRegistry, AppError> {
        let mut registry = ToolRegistry::new();
        if !request.use_tools {
            return Ok(registry);
        }

        let (kinds, explicit): (Vec<ToolKind>, bool) = match &request.preferred_tools {
            PreferredTools::All => (
                vec![ToolKind::Rag, ToolKind::WebSearch, ToolKind::McpTool],
                false,
            ),
            PreferredTools::Selected(names) => (
                names.iter().filter_map(|n| ToolKind::parse(n)).collect(),
                true,
            ),
        };

        let creds = self.users.credentials(user_id).await?;
        for kind in kinds {
            match kind {
                ToolKind::Rag => {
                    let embed_cred = pick_embedding_credential(&creds);
                    let embedder: Arc<dyn mentora_provider::EmbeddingProvider> =
                        Arc::from(self.gateway.embedding_provider(embed_cred));
                    let reranker: Arc<dyn mentora_provider::RerankProvider> =
                        Arc::from(self.gateway.rerank_provider(embed_cred));
                    registry.register(Box::new(RagTool::new(
                        self.retrieval.clone(),
                        embedder,
                        reranker,
                    )));
                }
                ToolKind::WebSearch => match &self.search {
                    Some(settings) => {
                        match self.gateway.web_search_provider(
                            &settings.engine,
                            &settings.api_key,
                            settings.base_url.as_deref(),
                        ) {
                            Ok(provider) => {
                                registry.register(Box::new(WebSearchTool::new(provider)))
                            }
                            Err(e) if explicit => return Err(e.into()),
                            Err(e) => {
                                tracing::debug!(error = %e, "web search unavailable, skipping tool");
                            }
                        }
                    }
                    None if explicit => {
                        return Err(ProviderError::Unconfigured(
                            "no active search engine configured".into(),
                        )
                        .into());
                    }
                    None => {}
                },
                ToolKind::McpTool => {
                    for config in &self.mcp_tools {
                        registry.register(Box::new(McpTool::new(config.clone())));
                    }
                }
            }
        }
        Ok(registry)
    }
}

fn pick_chat_credential(creds: &[UserCredential]) -> Option<&UserCredential> {
    CHAT_PROVIDER_ORDER
        .iter()
        .find_map(|p| creds.iter().find(|c| c.provider_type == *p))
}

fn pick_embedding_credential(creds: &[UserCredential]) -> Option<&UserCredential> {
    const ORDER: &[ProviderType] = &[
        ProviderType::SiliconFlow,
        ProviderType::OpenAI,
        ProviderType::Zhipu,
        ProviderType::ModelScope,
        ProviderType::Custom,
    ];
    ORDER
        .iter()
        .find_map(|p| creds.iter().find(|c| c.provider_type == *p))
}

fn answer_mode(executed: &[ExecutedTool]) -> String {
    let mut kinds: Vec<ToolKind> = executed.iter().filter_map(|e| e.kind).collect();
    kinds.sort();
    kinds.dedup();
    match kinds.as_slice() {
        [] => "general".to_string(),
        [one] => one.as_str().to_string(),
        _ => "hybrid".to_string(),
    }
}

fn collect_tool_payloads(executed: &[ExecutedTool]) -> (Vec<RetrievedSpan>, Vec<SearchHit>) {
    let mut spans = Vec::new();
    let mut hits = Vec::new();
    for e in executed {
        let Some(payload) = &e.payload else { continue };
        match e.kind {
            Some(ToolKind::Rag) => {
                if let Ok(parsed) = serde_json::from_value::<Vec<RetrievedSpan>>(payload.clone()) {
                    spans.extend(parsed);
                }
            }
            Some(ToolKind::WebSearch) => {
                if let Ok(parsed) = serde_json::from_value::<Vec<SearchHit>>(payload.clone()) {
                    hits.extend(parsed);
                }
            }
            _ => {}
        }
    }
    (spans, hits)
}
