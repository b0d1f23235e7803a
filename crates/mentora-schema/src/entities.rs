use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProviderType;

/// A platform tenant. Credentials stay ciphertext at rest; decryption
/// is lazy and per-request (see mentora-provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub total_points: i64,
    pub login_count: i64,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// One encrypted provider credential owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub id: i64,
    pub user_id: i64,
    pub provider_type: ProviderType,
    /// AES-256-GCM sealed API key, base64.
    pub encrypted_key: String,
    pub base_url: Option<String>,
    pub model_id: Option<String>,
    /// Per-provider model id list (chat, embedding, rerank overrides).
    #[serde(default)]
    pub model_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Private,
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "public" => AccessLevel::Public,
            _ => AccessLevel::Private,
        }
    }
}

/// Owner-scoped container of documents, articles and folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub access: AccessLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFolder {
    pub id: i64,
    pub kb_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// Hand-authored article inside a knowledge base. `content` feeds the
/// article's embedding; any edit to it re-embeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeArticle {
    pub id: i64,
    pub kb_id: i64,
    pub owner_id: i64,
    pub title: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DocumentStatus::Processing,
            "completed" => DocumentStatus::Completed,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

/// An uploaded document inside a knowledge base. One document produces
/// many chunks; `total_chunks` equals the chunk count once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: i64,
    pub kb_id: i64,
    pub owner_id: i64,
    pub file_name: String,
    pub blob_key: String,
    pub blob_public_url: String,
    pub mime: String,
    pub folder_id: Option<i64>,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub total_chunks: i64,
    pub created_at: DateTime<Utc>,
}

/// The atomic retrieval unit: a bounded span of extracted text with its
/// own embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: i64,
    pub document_id: i64,
    pub owner_id: i64,
    pub kb_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A conversation-scoped uploaded artifact that behaves like a
/// single-chunk document. Lifetime is the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporaryFile {
    pub id: i64,
    pub conversation_id: i64,
    pub owner_id: i64,
    pub file_name: String,
    pub blob_key: String,
    pub mime: String,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub extracted_text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub owner_id: i64,
    /// Null until auto-generated after the first user→assistant pair.
    pub title: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            _ => MessageRole::User,
        }
    }
}

/// Append-only conversation message. Order within a conversation is by
/// `sent_at`, assigned monotonically at transaction commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_output: Option<serde_json::Value>,
    pub llm_type_used: Option<String>,
    pub llm_model_used: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Message payload staged for a turn append; ids and `sent_at` are
/// assigned by the store at commit.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_output: Option<serde_json::Value>,
    pub llm_type_used: Option<String>,
    pub llm_model_used: Option<String>,
}

impl NewMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_output: None,
            llm_type_used: None,
            llm_model_used: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PointKind {
    #[serde(rename = "EARN")]
    Earn,
    #[serde(rename = "CONSUME")]
    Consume,
    #[serde(rename = "ADMIN_ADJUST")]
    AdminAdjust,
}

impl PointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointKind::Earn => "EARN",
            PointKind::Consume => "CONSUME",
            PointKind::AdminAdjust => "ADMIN_ADJUST",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CONSUME" => PointKind::Consume,
            "ADMIN_ADJUST" => PointKind::AdminAdjust,
            _ => PointKind::Earn,
        }
    }
}

/// Always written in the same transaction as the action that earned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointTransaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub reason: String,
    pub kind: PointKind,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Static achievement definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Achievement {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Counter this achievement watches, e.g. "FORUM_POSTS_COUNT".
    pub criteria_type: String,
    pub criteria_value: i64,
    pub reward_points: i64,
    pub is_active: bool,
}

/// Per-user grant; unique on (user_id, achievement_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAchievement {
    pub id: i64,
    pub user_id: i64,
    pub achievement_id: i64,
    pub earned_at: DateTime<Utc>,
    pub is_notified: bool,
}

/// Where a retrieved span came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanSource {
    Document,
    TemporaryFile,
}

/// One ranked retrieval result. For `TemporaryFile` spans,
/// `document_id` carries the temporary-file id and `kb_id` is zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSpan {
    pub chunk_id: i64,
    pub document_id: i64,
    pub kb_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
    pub source: SpanSource,
}

/// One web-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}
