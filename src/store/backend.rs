// src/store/backend.rs
//! Object storage backends. The store is a flat key → bytes namespace with
//! last-writer-wins semantics and no transactions.

use super::StoreError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Read a whole object. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a whole object, replacing any previous content.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
}

// ============================================================================
// HTTP BUCKET
// ============================================================================

/// Bucket exposed over plain HTTP: `GET`/`PUT {endpoint}/{bucket}/{key}`.
#[derive(Clone)]
pub struct HttpBucketStore {
    client: Client,
    endpoint: String,
    bucket: String,
    access_token: String,
}

impl HttpBucketStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            access_token: access_token.into(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpBucketStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let response = self
            .client
            .get(self.object_url(key))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| StoreError::Network(format!("GET {}: {}", key, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StoreError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Network(format!("GET {} body: {}", key, e)))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.object_url(key))
            .bearer_auth(&self.access_token)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Network(format!("PUT {}: {}", key, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StoreError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

// ============================================================================
// LOCAL DIRECTORY
// ============================================================================

/// A directory used as a bucket. Keys map to relative paths under `root`.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// In-memory backend. Shared by every clone of the `Arc` holding it, which is
/// how tests simulate several processes talking to one bucket.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let objects = match self.objects.read() {
            Ok(objects) => objects,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = objects.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StoreError::Network("memory store lock poisoned".to_string()))?;
        Ok(objects.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StoreError::Network("memory store lock poisoned".to_string()))?;
        objects.insert(key.to_string(), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(dir.path());

        assert!(store.get("config/absent.json").await.unwrap().is_none());

        store
            .put("config/present.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(store.get("config/present.json").await.unwrap(), Some(b"{}".to_vec()));
        assert!(dir.path().join("config").join("present.json").exists());
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(dir.path());
        let err = store.get("../outside.json").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        store.put("a", b"1".to_vec(), "text/plain").await.unwrap();
        store.put("a", b"2".to_vec(), "text/plain").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn test_http_object_url() {
        let store =
            HttpBucketStore::new("https://store.example.com/", "bucket", "t", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            store.object_url("/config/config_public.json"),
            "https://store.example.com/bucket/config/config_public.json"
        );
    }
}
