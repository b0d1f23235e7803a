use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use mentora_agent::{McpToolConfig, SearchEngineSettings};
use mentora_schema::NodeRole;

/// Full server configuration. Loaded from an optional TOML file merged
/// with `MENTORA_`-prefixed environment variables (`__` nests, e.g.
/// `MENTORA_SERVER__PORT=9000`); env wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub blob: BlobConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub search: Option<SearchEngineSettings>,
    #[serde(default)]
    pub mcp_tools: Vec<McpToolConfig>,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    pub backend: BlobBackend,
    /// Root directory for the local backend.
    pub local_root: PathBuf,
    /// S3-compatible endpoint settings.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Public URL prefix; `{public_base_url}/{key}` is reversible.
    pub public_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiry_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Master secret for the credential vault.
    pub credential_master_key: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub rerank_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: String,
    /// Address other nodes use to reach this node's worker endpoint.
    pub host: String,
    pub port: u16,
    pub region: String,
    pub ingest_concurrency: usize,
}

impl NodeConfig {
    pub fn role(&self) -> NodeRole {
        NodeRole::parse(&self.role)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8000,
            },
            database: DatabaseConfig {
                path: PathBuf::from("data/mentora.db"),
            },
            queue: QueueConfig {
                path: PathBuf::from("data/queue.db"),
            },
            blob: BlobConfig {
                backend: BlobBackend::Local,
                local_root: PathBuf::from("data/blobs"),
                endpoint: String::new(),
                bucket: String::new(),
                region: "us-east-1".into(),
                access_key: String::new(),
                secret_key: String::new(),
                public_base_url: "http://localhost:8000/blobs".into(),
            },
            auth: AuthConfig {
                jwt_secret: "change-me".into(),
                token_expiry_minutes: 60 * 24,
            },
            cors: CorsConfig {
                allowed_origins: vec!["http://localhost:5173".into()],
            },
            providers: ProvidersConfig {
                credential_master_key: "change-me-too".into(),
                chat_model: "gpt-4o-mini".into(),
                embedding_model: "text-embedding-3-small".into(),
                embedding_dimensions: 1536,
                rerank_model: "bge-reranker-v2-m3".into(),
            },
            search: None,
            mcp_tools: Vec::new(),
            node: NodeConfig {
                role: "hybrid".into(),
                host: "127.0.0.1".into(),
                port: 8000,
                region: "default".into(),
                ingest_concurrency: 4,
            },
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("MENTORA_").split("__"))
            .extract()
            .context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.node.role(), NodeRole::Hybrid);
        assert!(config.search.is_none());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mentora.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            host = "127.0.0.1"
            port = 9100

            [node]
            role = "coordinator"

            [search]
            engine = "tavily"
            api_key = "tvly-test"
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.node.role(), NodeRole::Coordinator);
        assert_eq!(config.search.unwrap().engine, "tavily");
        // Untouched sections keep their defaults.
        assert_eq!(config.providers.embedding_dimensions, 1536);
    }
}
