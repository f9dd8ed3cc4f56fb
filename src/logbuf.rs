use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Most recent chunks kept per container. The buffer is best-effort
/// console history, not durable log storage.
const MAX_ENTRIES: usize = 512;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// Shared in-memory console buffers keyed by container id. Entries are
/// appended by whichever session holds the log subscription for that
/// container and survive session detach.
pub struct LogBuffers {
    inner: RwLock<HashMap<String, VecDeque<LogEntry>>>,
}

impl Default for LogBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffers {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn append(&self, container_id: &str, content: String) {
        let mut buffers = self.inner.write().await;
        let buffer = buffers.entry(container_id.to_string()).or_default();
        if buffer.len() == MAX_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            timestamp: Utc::now(),
            content,
        });
    }

    /// Buffered history in arrival order.
    pub async fn snapshot(&self, container_id: &str) -> Vec<LogEntry> {
        self.inner
            .read()
            .await
            .get(container_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn drop_container(&self, container_id: &str) {
        self.inner.write().await.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_arrival_order() {
        let buffers = LogBuffers::new();
        buffers.append("cid", "one".to_string()).await;
        buffers.append("cid", "two".to_string()).await;

        let entries = buffers.snapshot("cid").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "one");
        assert_eq!(entries[1].content, "two");
    }

    #[tokio::test]
    async fn ring_drops_oldest_past_capacity() {
        let buffers = LogBuffers::new();
        for i in 0..(MAX_ENTRIES + 10) {
            buffers.append("cid", format!("line {i}")).await;
        }

        let entries = buffers.snapshot("cid").await;
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].content, "line 10");
    }

    #[tokio::test]
    async fn snapshot_of_unknown_container_is_empty() {
        let buffers = LogBuffers::new();
        assert!(buffers.snapshot("ghost").await.is_empty());
    }
}
