use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "INSTALLING")]
    Installing,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub state: InstanceState,
    #[serde(rename = "containerId")]
    pub container_id: Option<String>,
    #[serde(rename = "diskLimit", default)]
    pub disk_limit: u64,
}

pub type StateDocument = HashMap<String, InstanceRecord>;

/// Durable instance-state document at `storage/states.json`.
///
/// The whole document is rewritten on every update; writes go to a
/// temporary file first and are renamed into place so a crash mid-write
/// cannot leave the document unparseable. All read-modify-write pairs are
/// serialized through one mutex.
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Full document; created empty on first access. The bootstrap write
    /// takes the same lock as every update so it cannot clobber a record
    /// committed between the existence check and the write.
    pub async fn read(&self) -> Result<StateDocument> {
        let _guard = self.lock.lock().await;

        if !self.path.exists() {
            self.persist(&StateDocument::new()).await?;
            return Ok(StateDocument::new());
        }
        self.load().await
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.read().await?.remove(instance_id))
    }

    /// Replaces the record for `instance_id` wholesale.
    pub async fn update(
        &self,
        instance_id: &str,
        state: InstanceState,
        container_id: Option<String>,
        disk_limit: u64,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut document = if self.path.exists() {
            self.load().await?
        } else {
            StateDocument::new()
        };

        document.insert(
            instance_id.to_string(),
            InstanceRecord {
                state,
                container_id,
                disk_limit,
            },
        );

        self.persist(&document).await?;
        info!("State for {} set to {:?}", instance_id, state);
        Ok(())
    }

    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut document = if self.path.exists() {
            self.load().await?
        } else {
            StateDocument::new()
        };

        if document.remove(instance_id).is_some() {
            self.persist(&document).await?;
            info!("State record for {} removed", instance_id);
        }
        Ok(())
    }

    async fn load(&self) -> Result<StateDocument> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("State document {} is not valid JSON", self.path.display()))
    }

    async fn persist(&self, document: &StateDocument) -> Result<()> {
        let raw = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("states.json"))
    }

    #[tokio::test]
    async fn read_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        let document = states.read().await.unwrap();
        assert!(document.is_empty());
        assert!(dir.path().join("states.json").exists());
    }

    #[tokio::test]
    async fn update_replaces_record_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        states
            .update("inst-a", InstanceState::Installing, None, 512)
            .await
            .unwrap();
        states
            .update("inst-a", InstanceState::Ready, Some("cid-1".to_string()), 512)
            .await
            .unwrap();

        let record = states.get("inst-a").await.unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Ready);
        assert_eq!(record.container_id.as_deref(), Some("cid-1"));
        assert_eq!(record.disk_limit, 512);
    }

    #[tokio::test]
    async fn update_leaves_other_records_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        states
            .update("inst-a", InstanceState::Ready, Some("cid-a".to_string()), 0)
            .await
            .unwrap();
        let before = states.get("inst-a").await.unwrap().unwrap();

        states
            .update("inst-b", InstanceState::Failed, None, 128)
            .await
            .unwrap();

        assert_eq!(states.get("inst-a").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn document_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        states
            .update("inst-a", InstanceState::Failed, Some("cid".to_string()), 64)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("states.json")).unwrap();
        let parsed: StateDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, states.read().await.unwrap());
        assert_eq!(raw.matches("FAILED").count(), 1);
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        for _ in 0..2 {
            states
                .update("inst-a", InstanceState::Ready, Some("cid".to_string()), 16)
                .await
                .unwrap();
        }
        let document = states.read().await.unwrap();
        assert_eq!(document.len(), 1);
    }

    #[tokio::test]
    async fn remove_drops_only_the_named_record() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);

        states
            .update("inst-a", InstanceState::Ready, None, 0)
            .await
            .unwrap();
        states
            .update("inst-b", InstanceState::Ready, None, 0)
            .await
            .unwrap();

        states.remove("inst-a").await.unwrap();

        let document = states.read().await.unwrap();
        assert!(!document.contains_key("inst-a"));
        assert!(document.contains_key("inst-b"));
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let states = store(&dir);
        states
            .update("inst-a", InstanceState::Installing, None, 0)
            .await
            .unwrap();
        assert!(!dir.path().join("states.json.tmp").exists());
    }
}
