//! Content store and file-id indexer interfaces consumed by the core, plus
//! the filesystem-backed implementations wired in by the composition root.

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// On-disk representation format of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Text,
    Base64,
    Json,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Text => "text",
            FileFormat::Base64 => "base64",
            FileFormat::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FileFormat::Text),
            "base64" => Some(FileFormat::Base64),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

/// Document type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Notebook,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Notebook => "notebook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(FileType::File),
            "notebook" => Some(FileType::Notebook),
            _ => None,
        }
    }
}

/// File content in the requested representation.
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Text(String),
    Base64(String),
    Notebook(Value),
}

/// Result of a content-store read or write.
#[derive(Debug, Clone)]
pub struct FileModel {
    pub path: String,
    pub last_modified: DateTime<Utc>,
    pub content: Option<FileContent>,
}

/// The content store the core persists documents through.
#[async_trait]
pub trait ContentsStore: Send + Sync {
    /// Fetch a file. With `with_content = false` only metadata (notably
    /// `last_modified`) is populated; this is the out-of-band probe.
    async fn get(
        &self,
        path: &str,
        format: FileFormat,
        file_type: FileType,
        with_content: bool,
    ) -> Result<FileModel>;

    /// Save a file, returning its new metadata.
    async fn save(&self, path: &str, content: &FileContent) -> Result<FileModel>;
}

/// Resolves stable file ids to paths and back.
pub trait FileIdIndexer: Send + Sync {
    /// Return the id for a path, creating one if the path was never indexed.
    fn index(&self, path: &str) -> String;

    fn get_path(&self, file_id: &str) -> Option<String>;

    fn get_id(&self, path: &str) -> Option<String>;
}

/// Filesystem-backed content store rooted at a directory.
pub struct FsContentsStore {
    root: PathBuf,
}

impl FsContentsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::NotFound(format!("invalid path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentsStore for FsContentsStore {
    async fn get(
        &self,
        path: &str,
        format: FileFormat,
        _file_type: FileType,
        with_content: bool,
    ) -> Result<FileModel> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|_| Error::NotFound(format!("no such file: {path}")))?;
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let content = if with_content {
            Some(match format {
                FileFormat::Text => FileContent::Text(tokio::fs::read_to_string(&full).await?),
                FileFormat::Base64 => {
                    let bytes = tokio::fs::read(&full).await?;
                    FileContent::Base64(BASE64.encode(bytes))
                }
                FileFormat::Json => {
                    let text = tokio::fs::read_to_string(&full).await?;
                    FileContent::Notebook(serde_json::from_str(&text)?)
                }
            })
        } else {
            None
        };

        Ok(FileModel {
            path: path.to_string(),
            last_modified,
            content,
        })
    }

    async fn save(&self, path: &str, content: &FileContent) -> Result<FileModel> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match content {
            FileContent::Text(text) => tokio::fs::write(&full, text).await?,
            FileContent::Base64(encoded) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::Protocol(format!("invalid base64 content: {e}")))?;
                tokio::fs::write(&full, bytes).await?;
            }
            FileContent::Notebook(notebook) => {
                let text = serde_json::to_string_pretty(notebook)?;
                tokio::fs::write(&full, text).await?;
            }
        }

        let metadata = tokio::fs::metadata(&full).await?;
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(FileModel {
            path: path.to_string(),
            last_modified,
            content: None,
        })
    }
}

/// In-memory id index. Ids are stable for the process lifetime, which is all
/// the core requires; a persistent indexer can be wired in instead.
#[derive(Default)]
pub struct InMemoryFileIdIndexer {
    inner: Mutex<IndexerState>,
}

#[derive(Default)]
struct IndexerState {
    path_by_id: HashMap<String, String>,
    id_by_path: HashMap<String, String>,
}

impl InMemoryFileIdIndexer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileIdIndexer for InMemoryFileIdIndexer {
    fn index(&self, path: &str) -> String {
        let mut state = self.inner.lock();
        if let Some(id) = state.id_by_path.get(path) {
            return id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.id_by_path.insert(path.to_string(), id.clone());
        state.path_by_id.insert(id.clone(), path.to_string());
        id
    }

    fn get_path(&self, file_id: &str) -> Option<String> {
        self.inner.lock().path_by_id.get(file_id).cloned()
    }

    fn get_id(&self, path: &str) -> Option<String> {
        self.inner.lock().id_by_path.get(path).cloned()
    }
}
