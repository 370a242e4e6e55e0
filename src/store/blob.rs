use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use super::BlobStore;
use crate::error::{ProctorError, Result};

/// Writes blobs under a local directory and returns `file://` URLs.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(ProctorError::storage(format!("Invalid blob path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;

        let absolute = tokio::fs::canonicalize(&target).await?;
        tracing::info!(
            path = %absolute.display(),
            size = bytes.len(),
            content_type = %content_type,
            "Stored blob on local disk"
        );
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Response from the blob service upload API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Uploads blobs to an HTTP blob service as multipart form data.
pub struct HttpBlobStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, upload_timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(upload_timeout_secs))
            .build()
            .map_err(|e| ProctorError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn upload_url(&self, path: &str) -> String {
        format!("{}/upload?path={}", self.base_url, urlencoding::encode(path))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let size = bytes.len();

        let file_part = Part::bytes(bytes.to_vec())
            .file_name(file_name.clone())
            .mime_str(content_type)
            .map_err(|e| ProctorError::UploadFailed(format!("Invalid content type: {}", e)))?;

        let form = Form::new().part("file", file_part);

        let response = self
            .client
            .post(self.upload_url(path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProctorError::UploadFailed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProctorError::UploadFailed(format!(
                "Upload failed with status {}: {}",
                status, error_text
            )));
        }

        let upload: UploadResponse = response.json().await.map_err(|e| {
            ProctorError::UploadFailed(format!("Failed to parse response: {}", e))
        })?;

        tracing::info!(
            path = %path,
            size = size,
            file_name = %file_name,
            url = %upload.url,
            "Uploaded blob"
        );

        Ok(upload.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_deserialize() {
        let json = r#"{"url": "https://blobs.example/logging/c1/video/s1/rec_1.webm"}"#;
        let response: UploadResponse = serde_json::from_str(json).unwrap();
        assert!(response.url.ends_with("rec_1.webm"));
        assert!(response.size.is_none());
    }

    #[test]
    fn test_upload_url_encodes_path() {
        let store = HttpBlobStore::new("http://127.0.0.1:7000/", 5).unwrap();
        assert_eq!(
            store.upload_url("logging/c 1/rec.webm"),
            "http://127.0.0.1:7000/upload?path=logging%2Fc%201%2Frec.webm"
        );
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_paths() {
        let root = std::env::temp_dir().join(format!("proctor-blobs-{}", crate::media::random_id(8)));
        let store = LocalBlobStore::new(&root);

        let err = store
            .upload(Bytes::from_static(b"x"), "../outside.webm", "video/webm")
            .await;
        assert!(err.is_err());

        let url = store
            .upload(Bytes::from_static(b"clip"), "logging/c1/video/s1/rec_1.webm", "video/webm")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("rec_1.webm"));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
