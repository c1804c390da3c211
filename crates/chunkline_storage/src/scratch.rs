use std::io::{ErrorKind, Read, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

const SCRATCH_DIR: &str = "scratch";
const FILES_DIR: &str = "files";
const SCRATCH_EXTENSION: &str = "part";

#[derive(Debug, Clone)]
pub struct ChunkWriter {
    scratch_dir: PathBuf,
    files_dir: PathBuf,
}

impl ChunkWriter {
    pub async fn create(data_dir: &Path) -> Result<Self> {
        let scratch_dir = data_dir.join(SCRATCH_DIR);
        let files_dir = data_dir.join(FILES_DIR);
        for dir in [&scratch_dir, &files_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self {
            scratch_dir,
            files_dir,
        })
    }

    pub fn scratch_path(&self, session_id: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{session_id}.{SCRATCH_EXTENSION}"))
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub async fn write_at(&self, session_id: &str, offset: u64, bytes: &[u8]) -> Result<u64> {
        let path = self.scratch_path(session_id);
        // One handle per call: concurrent writers never share a cursor.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .with_context(|| format!("failed to open scratch file {}", path.display()))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek {} to {offset}", path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("failed to write {} bytes at {offset}", bytes.len()))?;
        file.flush().await.context("failed to flush scratch file")?;
        file.sync_data()
            .await
            .with_context(|| format!("failed to sync {}", path.display()))?;

        debug!(session_id, offset, len = bytes.len(), "chunk bytes written");
        Ok(bytes.len() as u64)
    }

    /// Renames the scratch file to `<files_dir>/<session_id>_<final_name>`.
    pub async fn assemble(&self, session_id: &str, final_name: &str) -> Result<PathBuf> {
        let name = Path::new(final_name)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("invalid final file name {final_name:?}"))?;

        let source = self.scratch_path(session_id);
        let destination = self.files_dir.join(format!("{session_id}_{name}"));
        fs::rename(&source, &destination).await.with_context(|| {
            format!(
                "failed to move {} to {}",
                source.display(),
                destination.display()
            )
        })?;
        Ok(destination)
    }

    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        let path = self.scratch_path(session_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
}

pub async fn file_digest(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .context("digest task panicked")?
}
