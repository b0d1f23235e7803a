use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::retry::{retry_with_backoff, DEFAULT_ATTEMPTS};

pub const CHAT_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool the model may call, with its JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A model-initiated tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on `tool` role messages carrying a tool result.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<ChatUsage>,
    pub model: String,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible implementation
// ---------------------------------------------------------------------------

/// Chat completions against any OpenAI-compatible endpoint. Stateless:
/// the credential is baked into the instance built per request.
#[derive(Clone)]
pub struct OpenAiCompatChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatChat {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = to_api_request(request);

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), truncate(&body, 500)));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal { status: 200, detail: format!("malformed chat response: {e}") })?;
        to_chat_response(body)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        retry_with_backoff(DEFAULT_ATTEMPTS, || self.chat_once(&request)).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ApiToolFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct ApiToolFunctionCall {
    name: String,
    /// JSON-encoded arguments, per the OpenAI wire format.
    arguments: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn to_api_request(request: &ChatRequest) -> ApiRequest {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|tool| ApiTool {
                    tool_type: "function".into(),
                    function: ApiFunctionDef {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    let messages = request
        .messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            call_type: "function".into(),
                            function: ApiToolFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect();

    ApiRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        tools,
    }
}

fn to_chat_response(body: ApiResponse) -> Result<ChatResponse, ProviderError> {
    let choice = body.choices.into_iter().next().ok_or(ProviderError::Fatal {
        status: 200,
        detail: "chat response contained no choices".into(),
    })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::Null);
            ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments,
            }
        })
        .collect();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: body.usage.map(|u| ChatUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        model: body.model,
    })
}

// ---------------------------------------------------------------------------
// Stub (tests and offline mode)
// ---------------------------------------------------------------------------

/// Deterministic chat stub: echoes the last user message. If
/// `scripted_tool_calls` is set, the first call returns them and
/// subsequent calls answer normally, enough to drive the agent loop in
/// tests.
pub struct StubChat {
    pub reply_prefix: String,
    pub scripted_tool_calls: std::sync::Mutex<Vec<ToolCallRequest>>,
}

impl StubChat {
    pub fn new(reply_prefix: impl Into<String>) -> Self {
        Self {
            reply_prefix: reply_prefix.into(),
            scripted_tool_calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool_calls(self, calls: Vec<ToolCallRequest>) -> Self {
        *self.scripted_tool_calls.lock().unwrap() = calls;
        self
    }
}

#[async_trait]
impl ChatProvider for StubChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let scripted = {
            let mut guard = self.scripted_tool_calls.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if !scripted.is_empty() && !request.tools.is_empty() {
            return Ok(ChatResponse {
                content: String::new(),
                tool_calls: scripted,
                usage: None,
                model: request.model,
            });
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            content: format!("{} {}", self.reply_prefix, last_user),
            tool_calls: Vec::new(),
            usage: Some(ChatUsage { prompt_tokens: 10, completion_tokens: 20, total_tokens: 30 }),
            model: request.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "bonjour"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
                "model": "test-model"
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatChat::new("sk-test", server.uri());
        let resp = provider
            .chat(ChatRequest::new("test-model", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(resp.content, "bonjour");
        assert_eq!(resp.usage.unwrap().total_tokens, 7);
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn chat_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"tools": [{"type": "function"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "rag", "arguments": "{\"query\": \"capital of France\"}"}
                    }]
                }}],
                "model": "test-model"
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatChat::new("sk-test", server.uri());
        let tools = vec![ToolDef {
            name: "rag".into(),
            description: "knowledge retrieval".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let resp = provider
            .chat(ChatRequest::new("test-model", vec![ChatMessage::user("q")]).with_tools(tools))
            .await
            .unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "rag");
        assert_eq!(resp.tool_calls[0].arguments["query"], "capital of France");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surface_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let provider = OpenAiCompatChat::new("sk-test", server.uri());
        let err = provider
            .chat(ChatRequest::new("m", vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn bad_request_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiCompatChat::new("sk-test", server.uri());
        let err = provider
            .chat(ChatRequest::new("m", vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Fatal { status: 400, .. }));
    }

    #[tokio::test]
    async fn stub_scripted_tool_calls_fire_once() {
        let stub = StubChat::new("[stub]").with_tool_calls(vec![ToolCallRequest {
            id: "c1".into(),
            name: "rag".into(),
            arguments: serde_json::json!({"query": "q"}),
        }]);
        let tools = vec![ToolDef {
            name: "rag".into(),
            description: String::new(),
            input_schema: serde_json::json!({}),
        }];

        let first = stub
            .chat(ChatRequest::new("m", vec![ChatMessage::user("q")]).with_tools(tools.clone()))
            .await
            .unwrap();
        assert_eq!(first.tool_calls.len(), 1);

        let second = stub
            .chat(ChatRequest::new("m", vec![ChatMessage::user("q")]).with_tools(tools))
            .await
            .unwrap();
        assert!(second.tool_calls.is_empty());
        assert!(second.content.starts_with("[stub]"));
    }
}
