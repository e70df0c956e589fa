//! Filesystem artifact sink, served by the API under `/artifacts`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{artifact_key, ArtifactError, ArtifactKind, ArtifactSink};
use crate::execution::ExecutionId;

pub struct FsArtifactSink {
    root: PathBuf,
    public_base_url: String,
}

impl FsArtifactSink {
    /// `public_base_url` is the prefix returned URLs start with, e.g.
    /// `http://127.0.0.1:8080/artifacts`.
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn put(
        &self,
        execution_id: ExecutionId,
        attempt: u32,
        kind: ArtifactKind,
        data: Bytes,
    ) -> Result<String, ArtifactError> {
        let key = artifact_key(execution_id, attempt, kind);
        let path = self.root.join(&key);
        let parent = path
            .parent()
            .ok_or_else(|| ArtifactError::Rejected(format!("bad artifact key {}", key)))?;
        tokio::fs::create_dir_all(parent).await?;

        // Readers never observe a partially written file.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let tmp = parent.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            execution_id = %execution_id,
            attempt,
            kind = kind.as_str(),
            bytes = data.len(),
            "artifact stored"
        );
        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_writes_file_and_returns_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = FsArtifactSink::new(dir.path(), "http://localhost:8080/artifacts/");
        let id = ExecutionId::new();

        let url = sink
            .put(id, 1, ArtifactKind::Log, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(
            url,
            format!("http://localhost:8080/artifacts/{}/attempt-1-log.txt", id)
        );

        let written = std::fs::read(dir.path().join(id.to_string()).join("attempt-1-log.txt")).unwrap();
        assert_eq!(written, b"hello");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = FsArtifactSink::new(dir.path(), "/artifacts");
        let id = ExecutionId::new();

        let a = sink
            .put(id, 2, ArtifactKind::Screenshot, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let b = sink
            .put(id, 2, ArtifactKind::Screenshot, Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(a, b);

        let entries: Vec<_> = std::fs::read_dir(dir.path().join(id.to_string()))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
