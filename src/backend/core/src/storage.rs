//! Object storage used for inspection photos and rendered reports.
//!
//! - **InMemoryStorage**: `DashMap`-backed, for tests and local runs
//! - **LocalStorage**: files under a root directory, `file://` URLs

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorCode, InspectorError, Result};

/// Bytes and media type of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Options for `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
        }
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch an object. A missing key is `ObjectNotFound`.
    async fn get(&self, key: &str) -> Result<StoredObject>;

    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions) -> Result<()>;

    /// Time-limited URL for downloading the object.
    async fn url(&self, key: &str, ttl: Duration) -> Result<String>;

    fn backend_name(&self) -> &'static str;
}

/// Guess a media type from the key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    let extension = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(InspectorError::new(
            ErrorCode::InvalidInput,
            format!("Invalid storage key: {}", key),
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: DashMap<String, StoredObject>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InspectorError::object_not_found(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, options: PutOptions) -> Result<()> {
        validate_key(key)?;
        let content_type = options
            .content_type
            .unwrap_or_else(|| content_type_for_key(key).to_string());
        self.objects
            .insert(key.to_string(), StoredObject { bytes, content_type });
        Ok(())
    }

    async fn url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.objects.contains_key(key) {
            return Err(InspectorError::object_not_found(key));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}?expires={}", key, expires))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local Filesystem Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        let path = self.path_for(key)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InspectorError::object_not_found(key)
            } else {
                InspectorError::from(e).with_context("key", key)
            }
        })?;

        Ok(StoredObject {
            bytes,
            content_type: content_type_for_key(key).to_string(),
        })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _options: PutOptions) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(key, path = %path.display(), "Stored object");
        Ok(())
    }

    async fn url(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(InspectorError::object_not_found(key));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("file://{}?expires={}", path.display(), expires))
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
