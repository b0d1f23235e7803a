//! Blob store adapter: opaque byte objects addressed by key, with a
//! reversible public URL.

pub mod local;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

/// Object-storage contract. Upload is atomic from the caller's view;
/// delete is idempotent. All operations may fail transiently; callers
/// retry or enqueue a compensation delete so a crashed request never
/// leaks a live blob.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL.
    async fn upload(&self, key: &str, bytes: &[u8], mime: &str) -> Result<String>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Idempotent: deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    fn public_url(&self, key: &str) -> String;

    /// Reverse a public URL back to its key. URLs outside the
    /// configured public prefix return `None` and MUST NOT be deleted
    /// as owned blobs.
    fn url_to_key(&self, url: &str) -> Option<String>;
}

/// Build a collision-free key under one of the well-known prefixes,
/// keeping the original extension for MIME sniffing on download.
pub fn make_key(prefix: &str, file_name: &str) -> String {
    let ext = file_name
        .rsplit('.')
        .next()
        .filter(|e| !e.is_empty() && e.len() <= 8 && *e != file_name)
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{prefix}/{}{ext}", Uuid::new_v4())
}

/// Shared URL reversal for stores whose public URL is
/// `{public_base_url}/{key}`.
pub(crate) fn strip_public_base<'a>(public_base_url: &str, url: &'a str) -> Option<&'a str> {
    let base = public_base_url.trim_end_matches('/');
    let rest = url.strip_prefix(base)?;
    let key = rest.strip_prefix('/')?;
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_key_keeps_extension_and_prefix() {
        let key = make_key("knowledge_documents", "Lecture Notes.PDF");
        assert!(key.starts_with("knowledge_documents/"));
        assert!(key.ends_with(".pdf"));
    }

    #[test]
    fn make_key_without_extension() {
        let key = make_key("forum_images", "README");
        assert!(key.starts_with("forum_images/"));
        assert!(!key.contains('.'));
    }

    #[test]
    fn make_key_is_unique_per_call() {
        let a = make_key("project_covers", "a.png");
        let b = make_key("project_covers", "a.png");
        assert_ne!(a, b);
    }

    #[test]
    fn strip_public_base_rejects_foreign_urls() {
        let base = "https://blobs.example.com";
        assert_eq!(
            strip_public_base(base, "https://blobs.example.com/k/v.txt"),
            Some("k/v.txt")
        );
        assert_eq!(strip_public_base(base, "https://evil.example.com/k"), None);
        assert_eq!(strip_public_base(base, "https://blobs.example.com/"), None);
        assert_eq!(strip_public_base(base, "https://blobs.example.com"), None);
    }
}
