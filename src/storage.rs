use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

/// Blob storage the service writes images into. Images are referenced by
/// public URL everywhere else, so the store only needs put/url/delete.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<()>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
    async fn delete(&self, bucket: &str, paths: &[String]) -> Result<()>;
}

/// Recovers the in-bucket path from a public URL, for blob cleanup when a
/// folder or environment is deleted.
pub fn storage_path_from_url(bucket: &str, url: &str) -> Option<String> {
    let marker = format!("/{bucket}/");
    let index = url.find(&marker)?;
    let path = &url[index + marker.len()..];
    let path = path.split(['?', '#']).next().unwrap_or(path);
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// HTTP bucket store speaking the storage API of the hosted backend
/// (upload, public object URLs, batched delete).
pub struct HttpObjectStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpObjectStore {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "storage upload of {bucket}/{path} failed with status {status}: {body}"
            ));
        }
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }

    async fn delete(&self, bucket: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = format!("{}/storage/v1/object/{bucket}", self.base_url);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "storage delete in {bucket} failed with status {status}: {body}"
            ));
        }
        info!("Deleted {} blob(s) from {bucket}", paths.len());
        Ok(())
    }
}

/// Process-local store used when no bucket is configured. Serves local
/// development and the test suite; URLs are not actually routable.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bucket: &str, path: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(&format!("{bucket}/{path}")))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        objects.insert(format!("{bucket}/{path}"), bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }

    async fn delete(&self, bucket: &str, paths: &[String]) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        for path in paths {
            if objects.remove(&format!("{bucket}/{path}")).is_none() {
                warn!("Delete of unknown blob {bucket}/{path}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_path_from_public_url() {
        let url = "https://cdn.example.com/storage/v1/object/public/dataset-images/ds-1/a.png";
        assert_eq!(
            storage_path_from_url("dataset-images", url),
            Some("ds-1/a.png".to_string())
        );
    }

    #[test]
    fn strips_query_fragment_and_rejects_foreign_buckets() {
        let url = "https://cdn.example.com/storage/v1/object/public/dataset-images/a.png?download=1";
        assert_eq!(
            storage_path_from_url("dataset-images", url),
            Some("a.png".to_string())
        );
        assert_eq!(storage_path_from_url("generated-images", url), None);
    }

    #[tokio::test]
    async fn memory_store_round_trips_and_deletes() {
        let store = MemoryObjectStore::new();
        store
            .put("b", "x/y.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert!(store.contains("b", "x/y.png"));

        store.delete("b", &["x/y.png".to_string()]).await.unwrap();
        assert!(store.is_empty());
    }
}
