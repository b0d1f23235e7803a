pub mod mcp;
pub mod rag;
pub mod web_search;

pub use mcp::{McpTool, McpToolConfig};
pub use rag::RagTool;
pub use web_search::WebSearchTool;
