use async_trait::async_trait;
use slug::slugify;
use tracing::info;

use crate::backend::ObjectStorage;
use crate::error::{ArtifactUploadError, error_chain};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Where a finished invoice goes so it can be shared by link.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores the document under `file_name` (overwriting) and returns its public URL.
    /// No retries happen here.
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, ArtifactUploadError>;
}

pub struct BucketArtifactStore<S> {
    storage: S,
    bucket: String,
}

impl<S: ObjectStorage> BucketArtifactStore<S> {
    pub fn new(storage: S, bucket: impl Into<String>) -> Self {
        Self { storage, bucket: bucket.into() }
    }
}

#[async_trait]
impl<S: ObjectStorage> ArtifactStore for BucketArtifactStore<S> {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, ArtifactUploadError> {
        let size = bytes.len();
        self.storage
            .upload(&self.bucket, file_name, bytes, PDF_CONTENT_TYPE, true)
            .await
            .map_err(|err| ArtifactUploadError { file_name: file_name.to_string(), detail: error_chain(&err) })?;
        let url = self.storage.public_url(&self.bucket, file_name);
        info!(bucket = %self.bucket, file_name, size, "invoice uploaded");
        Ok(url)
    }
}

/// `rahul_sharma_123456.pdf`: customer slug (whitespace as underscores) plus a bill label.
pub fn artifact_file_name(customer_name: &str, label: &str) -> String {
    let slug = slugify(customer_name.trim()).replace('-', "_");
    let slug = if slug.is_empty() { "customer".to_string() } else { slug };
    format!("{}_{}.pdf", slug, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;

    #[test]
    fn file_names_are_traceable() {
        assert_eq!(artifact_file_name("Rahul Sharma", "123456"), "rahul_sharma_123456.pdf");
        assert_eq!(artifact_file_name("  priya   patel ", "000042"), "priya_patel_000042.pdf");
        assert_eq!(artifact_file_name("", "1"), "customer_1.pdf");
    }

    #[tokio::test]
    async fn upload_returns_public_url_and_overwrites() {
        let storage = MemoryStore::new();
        let store = BucketArtifactStore::new(storage.clone(), "bills");

        let url = store.upload(b"%PDF-1".to_vec(), "Rahul_Sharma_1.pdf").await.unwrap();
        assert!(url.ends_with("bills/Rahul_Sharma_1.pdf"));
        store.upload(b"%PDF-2".to_vec(), "Rahul_Sharma_1.pdf").await.unwrap();
        assert_eq!(storage.object("bills", "Rahul_Sharma_1.pdf").unwrap(), b"%PDF-2");
    }

    #[tokio::test]
    async fn backend_detail_is_kept() {
        let storage = MemoryStore::new();
        storage.fail_uploads(Some("Bucket not found"));
        let store = BucketArtifactStore::new(storage, "bills");

        let err = store.upload(b"%PDF".to_vec(), "a.pdf").await.unwrap_err();
        assert_eq!(err.file_name, "a.pdf");
        assert!(err.detail.contains("Bucket not found"));
    }
}
