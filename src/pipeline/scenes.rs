use super::{progress_bar, prompts, short_id, EpisodePipeline};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{EpisodeState, GenerationMode, Scene, StageId};
use crate::services::llm::{generate_json, DEFAULT_MAX_TOKENS};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Deserialize)]
struct Breakdown {
    #[serde(default)]
    scenes: Vec<DraftScene>,
}

#[derive(Deserialize)]
struct DraftScene {
    prompt: String,
    #[serde(default)]
    setting_id: String,
    #[serde(default)]
    character_ids: Vec<String>,
    #[serde(default)]
    line_ids: Vec<String>,
}

fn image_file_for(scene_id: &str) -> String {
    format!("scenes/scene_{}.png", scene_id)
}

fn scene_not_found(scene_id: &str) -> PipelineError {
    PipelineError::not_found(format!("Scene {} not found", scene_id))
}

impl EpisodePipeline {
    /// Sets the style suffix appended to every image prompt of the episode.
    pub async fn set_art_style(&self, episode_id: &str, art_style: &str) -> PipelineResult<String> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;
        state.art_style = art_style.trim().to_string();
        self.store.save(&state).await?;
        Ok(state.art_style)
    }

    /// Splits the script into scenes. Rejected once any scene has an image.
    pub async fn generate_breakdown(&self, episode_id: &str) -> PipelineResult<Vec<Scene>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;
        if let Some(scene) = state.scenes.scenes.iter().find(|s| s.generated) {
            return Err(PipelineError::precondition(format!(
                "Cannot redo the breakdown: scene {} already has an image. Revert first.",
                scene.id
            )));
        }

        let breakdown: Breakdown = generate_json(
            self.llm.as_ref(),
            prompts::BREAKDOWN_SYSTEM,
            &prompts::scene_breakdown(&state),
            DEFAULT_MAX_TOKENS,
        )
        .await?;

        let scenes: Vec<Scene> = breakdown
            .scenes
            .into_iter()
            .enumerate()
            .map(|(order, draft)| {
                for line_id in &draft.line_ids {
                    if state.line(line_id).is_none() {
                        debug!("Breakdown references unknown line {}", line_id);
                    }
                }
                Scene {
                    id: short_id(),
                    order,
                    prompt: draft.prompt,
                    setting_id: draft.setting_id,
                    character_ids: draft.character_ids,
                    line_ids: draft.line_ids,
                    image_file: String::new(),
                    generated: false,
                }
            })
            .collect();

        state.scenes.scenes = scenes;
        state.scenes.approved = false;
        self.store.save(&state).await?;
        info!("Episode {}: broke script into {} scenes", episode_id, state.scenes.scenes.len());
        Ok(state.scenes.scenes)
    }

    /// Replaces the scene list. Image state is always taken from the stored
    /// scenes, and scenes with images cannot be dropped.
    pub async fn update_scenes(&self, episode_id: &str, scenes: Vec<Scene>) -> PipelineResult<Vec<Scene>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let mut scenes = scenes;
        let mut seen = HashSet::new();
        for scene in &mut scenes {
            if scene.id.is_empty() {
                scene.id = short_id();
            }
            if !seen.insert(scene.id.clone()) {
                return Err(PipelineError::precondition(format!(
                    "Duplicate scene id {}",
                    scene.id
                )));
            }
            match state.scene(&scene.id) {
                Some(stored) => {
                    scene.generated = stored.generated;
                    scene.image_file = stored.image_file.clone();
                }
                None => {
                    scene.generated = false;
                    scene.image_file.clear();
                }
            }
        }
        if let Some(dropped) = state
            .scenes
            .scenes
            .iter()
            .find(|s| s.generated && !seen.contains(&s.id))
        {
            return Err(PipelineError::precondition(format!(
                "Cannot delete scene {} with generated image. Revert first.",
                dropped.id
            )));
        }

        state.scenes.scenes = scenes;
        state.scenes.renumber();
        self.store.save(&state).await?;
        Ok(state.scenes.scenes)
    }

    /// Inserts `scene` at its `order`, clamped to the end of the list.
    pub async fn add_scene(&self, episode_id: &str, scene: Scene) -> PipelineResult<Vec<Scene>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let mut scene = scene;
        if scene.id.is_empty() {
            scene.id = short_id();
        }
        if state.scene(&scene.id).is_some() {
            return Err(PipelineError::precondition(format!(
                "Duplicate scene id {}",
                scene.id
            )));
        }
        scene.generated = false;
        scene.image_file.clear();

        let position = scene.order.min(state.scenes.scenes.len());
        state.scenes.scenes.insert(position, scene);
        state.scenes.renumber();
        self.store.save(&state).await?;
        Ok(state.scenes.scenes)
    }

    pub async fn delete_scene(&self, episode_id: &str, scene_id: &str) -> PipelineResult<Vec<Scene>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let scene = state.scene(scene_id).ok_or_else(|| scene_not_found(scene_id))?;
        if scene.generated {
            return Err(PipelineError::precondition(format!(
                "Cannot delete scene {} with generated image. Revert first.",
                scene_id
            )));
        }

        state.scenes.scenes.retain(|s| s.id != scene_id);
        state.scenes.renumber();
        self.store.save(&state).await?;
        Ok(state.scenes.scenes)
    }

    /// Illustrates one scene. Scenes can be illustrated in any order.
    pub async fn generate_scene_image(&self, episode_id: &str, scene_id: &str) -> PipelineResult<Scene> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let scene = state.scene(scene_id).ok_or_else(|| scene_not_found(scene_id))?;
        if scene.generated {
            return Err(PipelineError::precondition(format!(
                "Scene {} already has an image. Revert first.",
                scene_id
            )));
        }

        let image_file = self.illustrate(&state, scene).await?;
        let scene = state
            .scene_mut(scene_id)
            .ok_or_else(|| scene_not_found(scene_id))?;
        scene.image_file = image_file;
        scene.generated = true;
        let scene = scene.clone();
        self.store.save(&state).await?;
        info!("Episode {}: illustrated scene {}", episode_id, scene_id);
        Ok(scene)
    }

    /// Illustrates every scene still missing an image, saving after each one.
    pub async fn generate_all_scene_images(&self, episode_id: &str) -> PipelineResult<Vec<Scene>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let pending: Vec<usize> = (0..state.scenes.scenes.len())
            .filter(|&i| !state.scenes.scenes[i].generated)
            .collect();
        let pb = progress_bar(pending.len(), "Illustrating scenes");
        for index in pending {
            match self.illustrate(&state, &state.scenes.scenes[index]).await {
                Ok(image_file) => {
                    let scene = &mut state.scenes.scenes[index];
                    scene.image_file = image_file;
                    scene.generated = true;
                    self.store.save(&state).await?;
                    pb.inc(1);
                }
                Err(e) => {
                    pb.abandon_with_message("Illustration stopped");
                    warn!(
                        "Episode {}: scene {} failed: {}",
                        episode_id, state.scenes.scenes[index].id, e
                    );
                    return Err(e);
                }
            }
        }
        pb.finish_with_message("Illustration complete");
        Ok(state.scenes.scenes)
    }

    /// Renders the scene image and returns its path relative to the episode.
    async fn illustrate(&self, state: &EpisodeState, scene: &Scene) -> PipelineResult<String> {
        let mut references = Vec::new();
        references.extend(self.setting_reference(state, &scene.setting_id).await);
        references.extend(self.character_references(state, &scene.character_ids).await);

        let prompt = prompts::with_art_style(&scene.prompt, &state.art_style);
        let png = self.images.render(&prompt, &references).await?;
        let image_file = image_file_for(&scene.id);
        self.write_episode_file(&state.id, &image_file, &png).await?;
        Ok(image_file)
    }

    pub(super) async fn setting_reference(&self, state: &EpisodeState, setting_id: &str) -> Option<PathBuf> {
        let setting = state.context.settings.get(setting_id)?;
        self.reference_image(&self.config.settings_dir(), &setting.reference)
            .await
    }

    /// Reference images of `character_ids` that exist on disk, in the given order.
    pub(super) async fn character_references<S: AsRef<str>>(
        &self,
        state: &EpisodeState,
        character_ids: &[S],
    ) -> Vec<PathBuf> {
        let mut references = Vec::new();
        for id in character_ids {
            let Some(character) = state.context.characters.get(id.as_ref()) else {
                continue;
            };
            if let Some(path) = self
                .reference_image(&self.config.characters_dir(), &character.reference)
                .await
            {
                references.push(path);
            }
        }
        references
    }

    pub async fn revert_scene_image(&self, episode_id: &str, scene_id: &str) -> PipelineResult<Scene> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;

        let image_file = state
            .scene(scene_id)
            .ok_or_else(|| scene_not_found(scene_id))?
            .image_file
            .clone();
        let scene = state
            .scene_mut(scene_id)
            .ok_or_else(|| scene_not_found(scene_id))?;
        scene.image_file.clear();
        scene.generated = false;
        let scene = scene.clone();
        state.scenes.approved = false;
        self.store.save(&state).await?;
        self.delete_episode_file(episode_id, &image_file).await;
        info!("Episode {}: reverted scene {}", episode_id, scene_id);
        Ok(scene)
    }

    pub async fn set_scenes_mode(&self, episode_id: &str, mode: GenerationMode) -> PipelineResult<GenerationMode> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Scenes).await?;
        state.scenes.mode = mode;
        self.store.save(&state).await?;
        Ok(mode)
    }

    pub async fn approve_scenes(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Scenes, |state| {
            if state.scenes.scenes.is_empty() {
                return Err(PipelineError::precondition("Cannot approve without scenes"));
            }
            if let Some(scene) = state.scenes.scenes.iter().find(|s| !s.generated) {
                return Err(PipelineError::precondition(format!(
                    "Scene {} does not have an image generated",
                    scene.id
                )));
            }
            state.scenes.approved = true;
            Ok(())
        })
        .await
    }
}
