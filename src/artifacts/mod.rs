//! Artifact sinks: where screenshots and logs end up.

pub mod fs;
pub mod memory;

pub use self::fs::FsArtifactSink;
pub use self::memory::MemoryArtifactSink;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::execution::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Screenshot,
    Log,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Log => "log",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::Log => "txt",
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact store rejected upload: {0}")]
    Rejected(String),
}

/// Stable storage key for one artifact.  The same inputs always map to the
/// same key, which makes uploads idempotent.
pub fn artifact_key(execution_id: ExecutionId, attempt: u32, kind: ArtifactKind) -> String {
    format!(
        "{}/attempt-{}-{}.{}",
        execution_id,
        attempt,
        kind.as_str(),
        kind.extension()
    )
}

/// Stores artifact bytes and returns a URL callers can fetch them from.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn put(
        &self,
        execution_id: ExecutionId,
        attempt: u32,
        kind: ArtifactKind,
        data: Bytes,
    ) -> Result<String, ArtifactError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_is_stable() {
        let id: ExecutionId = "6f1c1f0e-8d1a-4d8e-9c55-0a7f6b0b2f11".parse().unwrap();
        assert_eq!(
            artifact_key(id, 2, ArtifactKind::Screenshot),
            "6f1c1f0e-8d1a-4d8e-9c55-0a7f6b0b2f11/attempt-2-screenshot.png"
        );
        assert_eq!(
            artifact_key(id, 2, ArtifactKind::Log),
            artifact_key(id, 2, ArtifactKind::Log)
        );
    }
}
