//! Content-addressed storage for externalized output artifacts.
//!
//! Artifacts live at `outputs_path/{file_id}/{cell_id}/{index}.output` and are
//! served back over `GET /api/outputs/{file_id}/{cell_id}/{index}`. The
//! dispatcher serializes outputs per cell, so no locking is needed within a
//! single key.

use crate::error::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub struct OutputStore {
    outputs_path: PathBuf,
}

impl OutputStore {
    pub fn new(outputs_path: impl Into<PathBuf>) -> Self {
        Self {
            outputs_path: outputs_path.into(),
        }
    }

    /// Write one artifact, creating directories as needed. Returns the URL
    /// clients can fetch the artifact from.
    pub async fn write(
        &self,
        file_id: &str,
        cell_id: &str,
        index: i64,
        output: &Value,
    ) -> Result<String> {
        let dir = self.cell_dir(file_id, cell_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{index}.output"));
        let body = serde_json::to_string(output)?;
        tokio::fs::write(&path, body).await?;
        Ok(Self::url(file_id, cell_id, index))
    }

    pub async fn read(&self, file_id: &str, cell_id: &str, index: i64) -> Result<Value> {
        let path = self
            .cell_dir(file_id, cell_id)?
            .join(format!("{index}.output"));
        let body = tokio::fs::read_to_string(&path).await.map_err(|_| {
            Error::NotFound(format!(
                "no output artifact for {file_id}/{cell_id}/{index}"
            ))
        })?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Remove every artifact of a cell. Missing directories are fine.
    pub async fn clear(&self, file_id: &str, cell_id: &str) -> Result<()> {
        let dir = self.cell_dir(file_id, cell_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn url(file_id: &str, cell_id: &str, index: i64) -> String {
        format!("/api/outputs/{file_id}/{cell_id}/{index}")
    }

    fn cell_dir(&self, file_id: &str, cell_id: &str) -> Result<PathBuf> {
        for part in [file_id, cell_id] {
            if part.is_empty() || Path::new(part).components().count() != 1 || part.contains("..") {
                return Err(Error::NotFound(format!("invalid artifact key: {part}")));
            }
        }
        Ok(self.outputs_path.join(file_id).join(cell_id))
    }
}
