pub mod chunker;
pub mod extract;
pub mod pipeline;
pub mod scan;

pub use chunker::{chunk_text, ChunkerConfig};
pub use extract::extract_text;
pub use pipeline::IngestionPipeline;
pub use scan::{validate_upload, UploadKind};
