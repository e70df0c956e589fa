//! In-memory artifact sink for tests and throwaway deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{artifact_key, ArtifactError, ArtifactKind, ArtifactSink};
use crate::execution::ExecutionId;

#[derive(Default)]
pub struct MemoryArtifactSink {
    objects: Mutex<HashMap<String, Bytes>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every subsequent `put` for `delay` before storing.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactSink {
    async fn put(
        &self,
        execution_id: ExecutionId,
        attempt: u32,
        kind: ArtifactKind,
        data: Bytes,
    ) -> Result<String, ArtifactError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ArtifactError::Rejected("memory sink set to fail".into()));
        }
        let key = artifact_key(execution_id, attempt, kind);
        self.objects
            .lock()
            .map_err(|_| ArtifactError::Rejected("memory sink poisoned".into()))?
            .insert(key.clone(), data);
        Ok(format!("memory://{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_fail_toggle() {
        let sink = MemoryArtifactSink::new();
        let id = ExecutionId::new();
        let url = sink
            .put(id, 1, ArtifactKind::Log, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(url.starts_with("memory://"));
        assert_eq!(sink.len(), 1);
        assert_eq!(
            sink.get(&artifact_key(id, 1, ArtifactKind::Log)).unwrap(),
            Bytes::from_static(b"x")
        );

        sink.set_failing(true);
        assert!(sink
            .put(id, 2, ArtifactKind::Log, Bytes::new())
            .await
            .is_err());
        assert_eq!(sink.len(), 1);
    }
}
