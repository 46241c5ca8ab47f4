/*!
File back-end: one JSON file per checkpoint.

Writes are durable-by-construction: serialize, write to a temp file in the
same directory, then rename into place. Readers always see either the old or
the new bytes, never a torn write. The directory is created lazily on first
write, and the number of in-flight writes is bounded by a semaphore.

With compression enabled, files are gzip-encoded and carry a `.json.gz`
extension; reads accept both encodings so the flag can change between runs.
*/

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Semaphore;
use tracing::warn;

use super::backend::{BackendError, StorageBackend};
use super::types::Checkpoint;

const PLAIN_EXT: &str = "json";
const COMPRESSED_EXT: &str = "json.gz";

pub struct FileBackend {
    root: PathBuf,
    compress: bool,
    write_permits: Arc<Semaphore>,
}

impl FileBackend {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, compress: bool, max_inflight_writes: usize) -> Self {
        Self {
            root: root.into(),
            compress,
            write_permits: Arc::new(Semaphore::new(max_inflight_writes.max(1))),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, checkpoint_id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{checkpoint_id}.{ext}"))
    }

    async fn ensure_root(&self) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, BackendError> {
        let plain = serde_json::to_vec(checkpoint).map_err(|source| BackendError::Decode {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            source,
        })?;
        if !self.compress {
            return Ok(plain);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain)?;
        Ok(encoder.finish()?)
    }

    fn decode(checkpoint_id: &str, bytes: &[u8], compressed: bool) -> Result<Checkpoint, BackendError> {
        let plain = if compressed {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            bytes.to_vec()
        };
        serde_json::from_slice(&plain).map_err(|source| BackendError::Decode {
            checkpoint_id: checkpoint_id.to_string(),
            source,
        })
    }

    async fn read_variant(
        &self,
        checkpoint_id: &str,
        ext: &str,
        compressed: bool,
    ) -> Result<Option<Checkpoint>, BackendError> {
        let path = self.path_for(checkpoint_id, ext);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Self::decode(checkpoint_id, &bytes, compressed).map(Some),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), BackendError> {
        let _permit = self
            .write_permits
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable {
                message: "file backend is shutting down".to_string(),
            })?;
        self.ensure_root().await?;

        let ext = if self.compress { COMPRESSED_EXT } else { PLAIN_EXT };
        let bytes = self.encode(checkpoint)?;
        let final_path = self.path_for(&checkpoint.checkpoint_id, ext);
        let tmp_path = self
            .root
            .join(format!(".{}.tmp", checkpoint.checkpoint_id));

        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, BackendError> {
        if let Some(found) = self.read_variant(checkpoint_id, PLAIN_EXT, false).await? {
            return Ok(Some(found));
        }
        self.read_variant(checkpoint_id, COMPRESSED_EXT, true).await
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError> {
        let mut removed = false;
        for ext in [PLAIN_EXT, COMPRESSED_EXT] {
            match tokio::fs::remove_file(self.path_for(checkpoint_id, ext)).await {
                Ok(()) => removed = true,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, BackendError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let (id, compressed) = if let Some(id) = name.strip_suffix(".json.gz") {
                (id.to_string(), true)
            } else if let Some(id) = name.strip_suffix(".json") {
                (id.to_string(), false)
            } else {
                continue;
            };
            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            match Self::decode(&id, &bytes, compressed) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                // A corrupt file must not poison the scan; Load/Validate on
                // its id still surface the decode failure.
                Err(error) => warn!(checkpoint_id = %id, error = %error, "skipping undecodable checkpoint file"),
            }
        }
        Ok(checkpoints)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
