use super::EpisodePipeline;
use crate::core::error::PipelineResult;
use crate::core::state::{
    CharacterProfile, ContextData, EpisodeState, EpisodeSummary, SettingProfile, StageId,
};
use anyhow::Context;
use log::{info, warn};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;

const REGISTRY_FILE: &str = "registry.json";

impl EpisodePipeline {
    /// Reads the character and setting registries and summarizes every other
    /// episode into the context of `episode_id`.
    pub async fn load_context(&self, episode_id: &str) -> PipelineResult<ContextData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Context).await?;

        let characters: BTreeMap<String, CharacterProfile> =
            self.read_registry(&self.config.characters_dir()).await?;
        let settings: BTreeMap<String, SettingProfile> =
            self.read_registry(&self.config.settings_dir()).await?;

        let mut history = Vec::new();
        for other_id in self.store.list_ids().await? {
            if other_id == episode_id {
                continue;
            }
            match self.store.load(&other_id).await {
                Ok(other) => history.push(summarize(&other)),
                Err(e) => warn!("Skipping {} in episode history: {}", other_id, e),
            }
        }

        state.context = ContextData {
            characters,
            settings,
            episode_history: history,
        };
        self.store.save(&state).await?;
        info!(
            "Episode {}: loaded {} characters, {} settings, {} past episodes",
            episode_id,
            state.context.characters.len(),
            state.context.settings.len(),
            state.context.episode_history.len()
        );
        Ok(state.context)
    }

    pub async fn approve_context(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Context, |_| Ok(()))
            .await
    }

    async fn read_registry<T: DeserializeOwned>(&self, dir: &Path) -> PipelineResult<T> {
        let path = dir.join(REGISTRY_FILE);
        let bytes = self.storage.read(&path).await?;
        let registry = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(registry)
    }
}

fn summarize(state: &EpisodeState) -> EpisodeSummary {
    let intro = &state.timeline.intro;
    let title = [&intro.title_en, &intro.title_zh]
        .into_iter()
        .find(|t| !t.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| state.id.clone());
    EpisodeSummary {
        id: state.id.clone(),
        title,
        summary: state.script.idea.clone(),
        date: String::new(),
    }
}
