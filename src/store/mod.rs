// src/store/mod.rs
//! Named JSON documents in a remote, transaction-less object store.
//!
//! Contract:
//! - `load` never fails for a missing or unparseable document; it returns the
//!   caller's default. It only fails when the store itself is unreachable.
//! - `save` serializes before touching the network, so an unwritable document
//!   can never clobber a good remote copy.
//! - Both stage bytes through a scratch file that is removed on every exit path.
//! - There is no cross-document atomicity and no locking. Two writers racing on
//!   one document: the last `put` wins.

pub mod backend;
pub mod documents;

use crate::config::{StoreBackendKind, StoreSettings};
use backend::{HttpBucketStore, LocalDirStore, MemoryStore, ObjectStore};
use documents::Versioned;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Network(String),
    #[error("store returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("document could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// What a versioned save observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub version: u64,
    /// Someone else wrote the document between our load and our save, and
    /// their write has just been overwritten.
    pub lost_update: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct VersionProbe {
    version: u64,
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn ObjectStore>,
    scratch_dir: PathBuf,
}

impl StateStore {
    pub fn new(backend: Arc<dyn ObjectStore>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Build the backend named in the settings.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let backend: Arc<dyn ObjectStore> = match &settings.backend {
            StoreBackendKind::Http {
                endpoint,
                bucket,
                access_token,
            } => Arc::new(HttpBucketStore::new(
                endpoint.clone(),
                bucket.clone(),
                access_token.clone(),
                settings.timeout,
            )?),
            StoreBackendKind::Local { root } => Arc::new(LocalDirStore::new(root.clone())),
            StoreBackendKind::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(backend, settings.scratch_dir.clone()))
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    /// Load `name`, or `default` when it is absent or malformed.
    pub async fn load<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, StoreError> {
        let bytes = match self.backend.get(name).await? {
            Some(bytes) => bytes,
            None => {
                debug!(document = name, "document not found, using default");
                return Ok(default);
            }
        };

        let scratch = ScratchFile::write(&self.scratch_dir, name, &bytes)?;
        match scratch.parse::<T>() {
            Ok(doc) => Ok(doc),
            Err(e) => {
                warn!(document = name, error = %e, "malformed document, using default");
                Ok(default)
            }
        }
    }

    /// Serialize and write `doc` under `name`, replacing the whole document.
    pub async fn save<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(doc)?;
        let scratch = ScratchFile::write(&self.scratch_dir, name, &body)?;
        self.backend
            .put(name, scratch.read_back()?, "application/json; charset=utf-8")
            .await?;
        debug!(document = name, bytes = body.len(), "document saved");
        Ok(())
    }

    /// Save with a bumped version. If the remote version moved since
    /// `loaded_version` was read, the overwrite still happens (last writer
    /// wins) but is reported and logged.
    pub async fn save_versioned<T>(
        &self,
        name: &str,
        doc: &mut T,
        loaded_version: u64,
    ) -> Result<SaveReport, StoreError>
    where
        T: Serialize + Versioned,
    {
        // Fail on unserializable input before any network round trip.
        serde_json::to_vec(&*doc)?;

        let remote = self.load(name, VersionProbe::default()).await?.version;
        let lost_update = remote != loaded_version;
        if lost_update {
            warn!(
                document = name,
                loaded_version,
                remote_version = remote,
                "lost update detected: document changed since it was loaded, overwriting"
            );
        }

        let version = remote.max(loaded_version) + 1;
        doc.set_version(version);
        self.save(name, &*doc).await?;
        info!(document = name, version, "document written");
        Ok(SaveReport {
            version,
            lost_update,
        })
    }
}

/// Local copy of a document, deleted when dropped.
struct ScratchFile {
    file: tempfile::NamedTempFile,
}

impl ScratchFile {
    fn write(dir: &Path, name: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let prefix = format!("{}.", name.replace(['/', '\\'], "_"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".scratch")
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file })
    }

    fn read_back(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        self.file.reopen()?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let reader = std::io::BufReader::new(self.file.reopen().map_err(serde_json::Error::io)?);
        serde_json::from_reader(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::documents::{FetchState, PipelineRun, PUBLIC_DOC};
    use super::*;
    use std::collections::HashMap;

    fn store_with(scratch: &Path) -> (Arc<MemoryStore>, StateStore) {
        let memory = Arc::new(MemoryStore::new());
        let store = StateStore::new(memory.clone(), scratch);
        (memory, store)
    }

    fn scratch_is_empty(dir: &Path) -> bool {
        !dir.exists() || std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_load_missing_returns_default() {
        let scratch = tempfile::tempdir().unwrap();
        let (_, store) = store_with(scratch.path());

        let default = FetchState {
            done: true,
            fetch_attempts: 3,
            task_id: None,
            version: 0,
        };
        let loaded = store.load("config/config_fetch.json", default.clone()).await.unwrap();
        assert_eq!(loaded, default);
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_load_malformed_returns_default() {
        let scratch = tempfile::tempdir().unwrap();
        let (memory, store) = store_with(scratch.path());
        memory
            .put(PUBLIC_DOC, b"{\"publish_list\": [".to_vec(), "application/json")
            .await
            .unwrap();

        let loaded = store.load(PUBLIC_DOC, PipelineRun::default()).await.unwrap();
        assert_eq!(loaded, PipelineRun::default());
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let scratch = tempfile::tempdir().unwrap();
        let (memory, store) = store_with(scratch.path());

        let mut run = PipelineRun::default();
        run.publish_list = vec!["media/t1".to_string(), "media/t2".to_string()];
        run.empty_folders.insert("media/t0".to_string());
        store.save(PUBLIC_DOC, &run).await.unwrap();

        let loaded = store.load(PUBLIC_DOC, PipelineRun::default()).await.unwrap();
        assert_eq!(loaded, run);

        let raw = String::from_utf8(memory.get(PUBLIC_DOC).await.unwrap().unwrap()).unwrap();
        assert!(raw.contains("\n  \"publish_list\""), "documents are pretty-printed");
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_unserializable_document_never_reaches_store() {
        let scratch = tempfile::tempdir().unwrap();
        let (memory, store) = store_with(scratch.path());
        memory.put("doc.json", b"{\"good\": true}".to_vec(), "application/json").await.unwrap();

        // serde_json refuses non-string map keys.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let err = store.save("doc.json", &bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialize(_)));
        assert_eq!(memory.get("doc.json").await.unwrap(), Some(b"{\"good\": true}".to_vec()));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_versioned_save_detects_concurrent_writer() {
        let scratch = tempfile::tempdir().unwrap();
        let (_, store) = store_with(scratch.path());

        let mut a = store.load(PUBLIC_DOC, PipelineRun::default()).await.unwrap();
        let mut b = store.load(PUBLIC_DOC, PipelineRun::default()).await.unwrap();
        let (a_loaded, b_loaded) = (a.version, b.version);

        b.publish_list.push("from-b".to_string());
        let first = store.save_versioned(PUBLIC_DOC, &mut b, b_loaded).await.unwrap();
        assert_eq!(first, SaveReport { version: 1, lost_update: false });

        a.publish_list.push("from-a".to_string());
        let second = store.save_versioned(PUBLIC_DOC, &mut a, a_loaded).await.unwrap();
        assert!(second.lost_update);
        assert_eq!(second.version, 2);

        let final_doc = store.load(PUBLIC_DOC, PipelineRun::default()).await.unwrap();
        assert_eq!(final_doc.publish_list, vec!["from-a".to_string()]);
    }
}
