use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::EpisodeState;
use anyhow::Context;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

const STATE_FILE: &str = "state.json";

/// One JSON document per episode under `<root>/<episode id>/state.json`.
///
/// Callers hold the guard returned by [`EpisodeStore::lock`] for the whole
/// load-mutate-save cycle so two operations on the same episode never
/// interleave their writes.
pub struct EpisodeStore {
    root: PathBuf,
    storage: Arc<dyn Storage>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EpisodeStore {
    pub fn new(root: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.into(),
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.root.join(episode_id)
    }

    fn state_path(&self, episode_id: &str) -> PathBuf {
        self.episode_dir(episode_id).join(STATE_FILE)
    }

    /// One mutex per episode id, kept for the life of the store. The map is
    /// bounded by the number of episodes.
    pub async fn lock(&self, episode_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(episode_id.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    pub async fn exists(&self, episode_id: &str) -> PipelineResult<bool> {
        validate_episode_id(episode_id)?;
        Ok(self.storage.exists(&self.state_path(episode_id)).await?)
    }

    pub async fn load(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        if !self.exists(episode_id).await? {
            return Err(PipelineError::not_found(format!(
                "Episode {} not found",
                episode_id
            )));
        }
        let path = self.state_path(episode_id);
        let bytes = self.storage.read(&path).await?;
        let state: EpisodeState = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(state)
    }

    pub async fn save(&self, state: &EpisodeState) -> PipelineResult<()> {
        validate_episode_id(&state.id)?;
        let content = serde_json::to_string_pretty(state)?;
        self.storage
            .write(&self.state_path(&state.id), content.as_bytes())
            .await?;
        debug!("Saved state for {} ({:?})", state.id, state.current_stage);
        Ok(())
    }

    pub async fn create(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        if self.exists(episode_id).await? {
            return Err(PipelineError::precondition(format!(
                "Episode {} already exists",
                episode_id
            )));
        }
        let state = EpisodeState::new(episode_id);
        self.save(&state).await?;
        Ok(state)
    }

    /// Ids of every directory under the root that holds a state document.
    pub async fn list_ids(&self) -> PipelineResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.storage.list(&self.root).await? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if validate_episode_id(&name).is_err() {
                continue;
            }
            if self.storage.exists(&entry.join(STATE_FILE)).await? {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Next free `ep_NNN` id.
    pub async fn next_episode_id(&self) -> PipelineResult<String> {
        let highest = self
            .list_ids()
            .await?
            .iter()
            .filter_map(|id| id.strip_prefix("ep_").and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        Ok(format!("ep_{:03}", highest + 1))
    }
}

/// Episode ids become directory names, so only a conservative character set
/// is accepted.
pub fn validate_episode_id(episode_id: &str) -> PipelineResult<()> {
    let valid = !episode_id.is_empty()
        && episode_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::not_found(format!(
            "Episode {} not found",
            episode_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::StageId;

    fn store_in(dir: &Path) -> EpisodeStore {
        EpisodeStore::new(dir, Arc::new(NativeStorage::new()))
    }

    #[tokio::test]
    async fn test_create_load_save() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store_in(temp_dir.path());

        let mut state = store.create("ep_001").await?;
        assert_eq!(state.current_stage, StageId::Context);
        assert!(temp_dir.path().join("ep_001").join("state.json").exists());

        state.script.seed = "a lost kite".to_string();
        store.save(&state).await?;

        let loaded = store.load("ep_001").await?;
        assert_eq!(loaded, state);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_episode_is_not_found() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store_in(temp_dir.path());
        let err = store.load("ep_404").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_path_like_ids_are_rejected() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store_in(temp_dir.path());
        assert!(store.load("../etc").await.unwrap_err().is_not_found());
        assert!(store.load("").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store_in(temp_dir.path());
        store.create("ep_001").await?;
        assert!(store.create("ep_001").await.unwrap_err().is_precondition());
        Ok(())
    }

    #[tokio::test]
    async fn test_next_episode_id_follows_highest() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store_in(temp_dir.path());
        assert_eq!(store.next_episode_id().await?, "ep_001");
        store.create("ep_001").await?;
        store.create("ep_007").await?;
        std::fs::create_dir_all(temp_dir.path().join("ep_099"))?; // no state.json
        assert_eq!(store.list_ids().await?, vec!["ep_001", "ep_007"]);
        assert_eq!(store.next_episode_id().await?, "ep_008");
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_serializes_same_episode() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(store_in(temp_dir.path()));

        let guard = store.lock("ep_001").await;
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _guard = store.lock("ep_001").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Other episodes are not blocked.
        let _other = store.lock("ep_002").await;

        drop(guard);
        contender.await?;
        Ok(())
    }
}
