use super::{prompts, EpisodePipeline};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{EpisodeState, Scene, StageId, ThumbnailData};
use log::info;

pub const THUMBNAIL_FILE: &str = "thumbnail.png";
const PROMPT_MAX_TOKENS: u32 = 512;

/// The setting used by the most scenes; ties go to the one seen first.
pub fn most_used_setting(scenes: &[Scene]) -> Option<&str> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for scene in scenes.iter().filter(|s| !s.setting_id.is_empty()) {
        match counts.iter_mut().find(|(id, _)| *id == scene.setting_id) {
            Some((_, n)) => *n += 1,
            None => counts.push((scene.setting_id.as_str(), 1)),
        }
    }
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map(|(id, _)| id)
}

impl EpisodePipeline {
    /// Drafts the thumbnail prompt from the idea, the speakers and the
    /// opening dialogue.
    pub async fn initialize_thumbnail(&self, episode_id: &str) -> PipelineResult<ThumbnailData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Thumbnail).await?;

        let prompt = self
            .llm
            .chat(
                prompts::THUMBNAIL_SYSTEM,
                &prompts::thumbnail(&state),
                PROMPT_MAX_TOKENS,
            )
            .await?;
        state.thumbnail.prompt = prompt.trim().to_string();
        self.store.save(&state).await?;
        Ok(state.thumbnail)
    }

    /// Replaces the prompt. An existing image is kept until reverted.
    pub async fn update_thumbnail_prompt(
        &self,
        episode_id: &str,
        prompt: &str,
    ) -> PipelineResult<ThumbnailData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Thumbnail).await?;
        state.thumbnail.prompt = prompt.to_string();
        self.store.save(&state).await?;
        Ok(state.thumbnail)
    }

    pub async fn generate_thumbnail(&self, episode_id: &str) -> PipelineResult<ThumbnailData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Thumbnail).await?;
        if state.thumbnail.prompt.trim().is_empty() {
            return Err(PipelineError::precondition("Thumbnail prompt is empty"));
        }
        if state.thumbnail.generated {
            return Err(PipelineError::precondition(
                "Thumbnail already generated. Revert first.",
            ));
        }

        let mut references = Vec::new();
        if let Some(setting_id) = most_used_setting(&state.scenes.scenes) {
            references.extend(self.setting_reference(&state, setting_id).await);
        }
        references.extend(
            self.character_references(&state, &state.speaking_characters())
                .await,
        );

        let prompt = prompts::with_art_style(&state.thumbnail.prompt, &state.art_style);
        let png = self.images.render(&prompt, &references).await?;
        self.write_episode_file(episode_id, THUMBNAIL_FILE, &png)
            .await?;

        state.thumbnail.image_file = THUMBNAIL_FILE.to_string();
        state.thumbnail.generated = true;
        self.store.save(&state).await?;
        info!("Episode {}: thumbnail rendered", episode_id);
        Ok(state.thumbnail)
    }

    pub async fn revert_thumbnail(&self, episode_id: &str) -> PipelineResult<ThumbnailData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Thumbnail).await?;
        let image_file = std::mem::take(&mut state.thumbnail.image_file);
        state.thumbnail.generated = false;
        state.thumbnail.approved = false;
        self.store.save(&state).await?;
        self.delete_episode_file(episode_id, &image_file).await;
        Ok(state.thumbnail)
    }

    pub async fn approve_thumbnail(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Thumbnail, |state| {
            if !state.thumbnail.generated {
                return Err(PipelineError::precondition(
                    "Must generate thumbnail before approving",
                ));
            }
            state.thumbnail.approved = true;
            Ok(())
        })
        .await
    }
}
