pub mod entities;
pub mod error;
pub mod queue;

pub use entities::*;
pub use error::{AppError, AppResult};
pub use queue::*;

use serde::{Deserialize, Serialize};

/// External model provider families. All of them speak an
/// OpenAI-compatible wire format; they differ in default base URL and
/// default model ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    SiliconFlow,
    Zhipu,
    ModelScope,
    /// Custom OpenAI-compatible endpoint; requires an explicit base URL.
    Custom,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::SiliconFlow => "siliconflow",
            ProviderType::Zhipu => "zhipu",
            ProviderType::ModelScope => "modelscope",
            ProviderType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderType::OpenAI),
            "siliconflow" => Some(ProviderType::SiliconFlow),
            "zhipu" => Some(ProviderType::Zhipu),
            "modelscope" => Some(ProviderType::ModelScope),
            "custom" => Some(ProviderType::Custom),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "https://api.openai.com/v1",
            ProviderType::SiliconFlow => "https://api.siliconflow.cn/v1",
            ProviderType::Zhipu => "https://open.bigmodel.cn/api/paas/v4",
            ProviderType::ModelScope => "https://api-inference.modelscope.cn/v1",
            ProviderType::Custom => "",
        }
    }
}

/// Well-known blob key prefixes. The public URL for a key is
/// `{public_base_url}/{key}` and is reversible (see mentora-blob).
pub mod blob_prefix {
    pub const KNOWLEDGE_DOCUMENTS: &str = "knowledge_documents";
    pub const KNOWLEDGE_IMAGES: &str = "knowledge_images";
    pub const AI_CHAT_TEMP_FILES: &str = "ai_chat_temp_files";
    pub const PROJECT_COVERS: &str = "project_covers";
    pub const FORUM_IMAGES: &str = "forum_images";
}
