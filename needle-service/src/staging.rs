//! Local byte staging for uploads.
//!
//! Files are written under `<root>/<task_id>/<file_id>/<filename>` before
//! they are leased and uploaded, and read back for the file content
//! endpoint. The file id keeps same-named uploads in one task apart.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::error::{ServiceResult, StagingError};

pub struct FileStaging {
    root: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> StagingError {
    StagingError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Reject names that would escape the task directory
fn validate_file_name(name: &str) -> Result<(), StagingError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');

    if invalid {
        return Err(StagingError::InvalidFileName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl FileStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` to the file's staging directory and return its path
    pub async fn stage_bytes(
        &self,
        task_id: &str,
        file_id: i64,
        filename: &str,
        content: &[u8],
    ) -> ServiceResult<PathBuf> {
        validate_file_name(task_id)?;
        validate_file_name(filename)?;

        let dir = self.root.join(task_id).join(file_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let path = dir.join(filename);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(&path, e))?;

        Ok(path)
    }

    /// Compute SHA-256 of a staged file, returning a hex string.
    ///
    /// Streams the file so large uploads are never held twice in memory.
    pub async fn checksum(&self, path: &Path) -> ServiceResult<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 8192];

        loop {
            let bytes_read = file
                .read(&mut buffer)
                .await
                .map_err(|e| io_error(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    pub async fn read_bytes(&self, path: &Path) -> ServiceResult<Vec<u8>> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(content)
    }

    /// Remove a single staged file; a missing file is not an error
    pub async fn remove_file(&self, path: &Path) -> ServiceResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e).into()),
        }
    }

    /// Remove everything staged for a task; a missing directory is not an error
    pub async fn remove_task_dir(&self, task_id: &str) -> ServiceResult<()> {
        validate_file_name(task_id)?;

        let dir = self.root.join(task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir, e).into()),
        }
    }
}
