pub mod conversations;
pub mod db;
pub mod knowledge;
pub mod migrations;
pub mod users;
pub mod vector;

pub use conversations::ConversationRepo;
pub use db::Database;
pub use knowledge::KnowledgeRepo;
pub use users::UserRepo;
pub use vector::{ChunkFilter, NewChunk, VectorIndex};

/// Serialize an embedding the way it is stored (JSON float array).
pub fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_owned())
}

pub fn json_to_embedding(json: &str) -> anyhow::Result<Vec<f32>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str::<Vec<f32>>(json)?)
}

/// The agreed placeholder embedding used when no provider credential is
/// available. It never matches a real query above threshold.
pub fn zero_vector(dims: usize) -> Vec<f32> {
    vec![0.0; dims]
}

pub fn is_zero_vector(embedding: &[f32]) -> bool {
    embedding.iter().all(|v| *v == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_json_roundtrip() {
        let input = vec![0.25_f32, -1.5, 3.0];
        let json = embedding_to_json(&input);
        let output = json_to_embedding(&json).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn empty_json_is_empty_embedding() {
        assert!(json_to_embedding("").unwrap().is_empty());
        assert!(json_to_embedding("  ").unwrap().is_empty());
    }

    #[test]
    fn zero_vector_detection() {
        assert!(is_zero_vector(&zero_vector(8)));
        assert!(is_zero_vector(&[]));
        assert!(!is_zero_vector(&[0.0, 0.1]));
    }
}
