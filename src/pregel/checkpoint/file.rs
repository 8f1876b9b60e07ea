//! File-based step store
//!
//! Stores each workflow (envelope plus step records) as one JSON document.
//! Supports optional compression via zstd.
//!
//! # Directory Structure
//!
//! ```text
//! workflows/
//! ├── order-42.json[.zst]
//! └── order-42%2Freview.json[.zst]   (nested workflow "order-42/review")
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{upsert_record, StepStore, WorkflowRecord};
use crate::pregel::error::RunError;
use crate::pregel::step::StepRecord;

/// On-disk document for one workflow
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    workflow: Option<WorkflowRecord>,
    #[serde(default)]
    steps: Vec<StepRecord>,
}

/// File-based step store.
///
/// Every mutation rewrites the workflow's document. Atomic writes are
/// ensured via temporary file + rename, and mutations are serialised through
/// one lock so concurrent nested runs never interleave a read-modify-write.
#[derive(Debug)]
pub struct FileStepStore {
    /// Directory holding workflow documents
    base_path: PathBuf,
    /// Whether to compress documents with zstd
    compression: bool,
    write_lock: Mutex<()>,
}

impl FileStepStore {
    /// Create a new file-based store rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
            write_lock: Mutex::new(()),
        }
    }

    fn extension(&self) -> &'static str {
        if self.compression {
            ".json.zst"
        } else {
            ".json"
        }
    }

    /// File path of a workflow document
    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.base_path
            .join(format!("{}{}", encode_id(workflow_id), self.extension()))
    }

    /// Temporary file path for atomic writes
    fn temp_path(&self, workflow_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.tmp", encode_id(workflow_id)))
    }

    async fn ensure_dir(&self) -> Result<(), RunError> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| RunError::storage(format!("Failed to create directory: {}", e)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, RunError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| RunError::storage(format!("Compression init failed: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| RunError::storage(format!("Compression write failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| RunError::storage(format!("Compression finish failed: {}", e)))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, RunError> {
        zstd::stream::decode_all(data)
            .map_err(|e| RunError::storage(format!("Decompression failed: {}", e)))
    }

    async fn read(&self, workflow_id: &str) -> Result<WorkflowFile, RunError> {
        let path = self.workflow_path(workflow_id);
        if !path.exists() {
            return Ok(WorkflowFile::default());
        }

        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| RunError::storage(format!("Failed to open file: {}", e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| RunError::storage(format!("Failed to read file: {}", e)))?;

        let json = if self.compression {
            Self::decompress(&data)?
        } else {
            data
        };

        serde_json::from_slice(&json)
            .map_err(|e| RunError::storage(format!("Deserialization failed: {}", e)))
    }

    async fn write(&self, workflow_id: &str, document: &WorkflowFile) -> Result<(), RunError> {
        self.ensure_dir().await?;

        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| RunError::storage(format!("Serialization failed: {}", e)))?;

        let data = if self.compression {
            Self::compress(&json)?
        } else {
            json
        };

        let temp_path = self.temp_path(workflow_id);
        let final_path = self.workflow_path(workflow_id);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| RunError::storage(format!("Failed to create temp file: {}", e)))?;

        file.write_all(&data)
            .await
            .map_err(|e| RunError::storage(format!("Failed to write data: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| RunError::storage(format!("Failed to sync file: {}", e)))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| RunError::storage(format!("Failed to rename file: {}", e)))
    }

    /// Workflow id encoded in a document file name
    fn parse_workflow_id(&self, path: &Path) -> Option<String> {
        let filename = path.file_name()?.to_str()?;
        let encoded = filename.strip_suffix(self.extension())?;
        decode_id(encoded)
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_.-]` so nested ids
/// (`parent/child`) stay flat, reversible file names.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_id(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl StepStore for FileStepStore {
    async fn append_or_update_step(
        &self,
        workflow_id: &str,
        record: &StepRecord,
    ) -> Result<(), RunError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read(workflow_id).await?;
        upsert_record(&mut document.steps, record);
        self.write(workflow_id, &document).await
    }

    async fn load_steps(&self, workflow_id: &str) -> Result<Vec<StepRecord>, RunError> {
        Ok(self.read(workflow_id).await?.steps)
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, RunError> {
        Ok(self.read(workflow_id).await?.workflow)
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), RunError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read(&workflow.id).await?;
        document.workflow = Some(workflow.clone());
        self.write(&workflow.id, &document).await
    }

    async fn list_workflows(&self) -> Result<Vec<String>, RunError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| RunError::storage(format!("Failed to read directory: {}", e)))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RunError::storage(format!("Failed to read entry: {}", e)))?
        {
            if let Some(id) = self.parse_workflow_id(&entry.path()) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), RunError> {
        let _guard = self.write_lock.lock().await;
        let path = self.workflow_path(workflow_id);

        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| RunError::storage(format!("Failed to delete file: {}", e)))?;
        }

        Ok(())
    }
}
