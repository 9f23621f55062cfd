pub mod assembly;
pub mod captions;
pub mod context;
pub mod prompts;
pub mod scenes;
pub mod script;
pub mod stage;
pub mod stitch;
pub mod thumbnail;
pub mod timeline;
pub mod tts;

use crate::core::config::Config;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::{EpisodeState, StageId};
use crate::core::store::EpisodeStore;
use crate::services::image::ImageClient;
use crate::services::llm::LlmClient;
use crate::services::media::MediaRenderer;
use crate::services::tts::TtsClient;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use stage::{StageDescriptor, STAGES};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Drives episodes through the stage pipeline. Every operation runs its
/// load-mutate-save cycle under the episode's lock and persists nothing when
/// it fails.
pub struct EpisodePipeline {
    config: Config,
    store: EpisodeStore,
    storage: Arc<dyn Storage>,
    llm: Box<dyn LlmClient>,
    tts: Box<dyn TtsClient>,
    images: Box<dyn ImageClient>,
    media: Box<dyn MediaRenderer>,
    create_lock: tokio::sync::Mutex<()>,
}

impl EpisodePipeline {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        llm: Box<dyn LlmClient>,
        tts: Box<dyn TtsClient>,
        images: Box<dyn ImageClient>,
        media: Box<dyn MediaRenderer>,
    ) -> Self {
        let store = EpisodeStore::new(config.episodes_dir(), storage.clone());
        Self {
            config,
            store,
            storage,
            llm,
            tts,
            images,
            media,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &EpisodeStore {
        &self.store
    }

    pub fn stages(&self) -> &'static [StageDescriptor] {
        &STAGES
    }

    /// Creates the next `ep_NNN` episode with default sub-documents.
    pub async fn create_episode(&self) -> PipelineResult<EpisodeState> {
        let _guard = self.create_lock.lock().await;
        let id = self.store.next_episode_id().await?;
        let state = self.store.create(&id).await?;
        info!("Created episode {}", id);
        Ok(state)
    }

    pub async fn episode(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.store.load(episode_id).await
    }

    pub async fn list_episodes(&self) -> PipelineResult<Vec<String>> {
        self.store.list_ids().await
    }

    pub fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.store.episode_dir(episode_id)
    }

    /// Loads the episode and rejects the call unless `stage` can be entered.
    async fn load_in_stage(&self, episode_id: &str, stage: StageId) -> PipelineResult<EpisodeState> {
        let state = self.store.load(episode_id).await?;
        stage::ensure_entry(stage, &state)?;
        Ok(state)
    }

    /// Shared body of every `approve_*` operation. `approve` marks the
    /// candidate approved (or rejects it); the exit gate is then checked on the
    /// candidate, so nothing is persisted on rejection.
    async fn approve_stage<F>(
        &self,
        episode_id: &str,
        stage: StageId,
        approve: F,
    ) -> PipelineResult<EpisodeState>
    where
        F: FnOnce(&mut EpisodeState) -> PipelineResult<()>,
    {
        let _guard = self.store.lock(episode_id).await;
        let state = self.load_in_stage(episode_id, stage).await?;

        let mut candidate = state.clone();
        approve(&mut candidate)?;
        let next = stage::advance(stage, &mut candidate)?;
        self.store.save(&candidate).await?;
        info!("Episode {}: {} approved, now at {}", episode_id, stage, next);
        Ok(candidate)
    }

    async fn write_episode_file(
        &self,
        episode_id: &str,
        relative: &str,
        content: &[u8],
    ) -> PipelineResult<PathBuf> {
        let path = self.episode_dir(episode_id).join(relative);
        self.storage.write(&path, content).await?;
        Ok(path)
    }

    /// Removes a media file the saved state no longer points at. Failures are
    /// only logged.
    async fn delete_episode_file(&self, episode_id: &str, relative: &str) {
        if relative.is_empty() {
            return;
        }
        let path = self.episode_dir(episode_id).join(relative);
        if let Err(e) = self.storage.delete(&path).await {
            warn!("Could not remove {}: {:#}", path.display(), e);
        }
    }

    /// Resolves a registry `reference` to an image on disk, if it exists.
    async fn reference_image(&self, registry_dir: &Path, reference: &str) -> Option<PathBuf> {
        if reference.trim().is_empty() {
            return None;
        }
        let path = self.config.reference_path(registry_dir, reference);
        match self.storage.exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Speaks `text` with the voice of `character_id`, stores the audio at
    /// `relative` and returns its probed duration. The written file is removed
    /// again if probing fails.
    async fn voice_line(
        &self,
        state: &EpisodeState,
        character_id: &str,
        text: &str,
        relative: &str,
    ) -> PipelineResult<u64> {
        let character = state.context.characters.get(character_id).ok_or_else(|| {
            PipelineError::not_found(format!("Character {} not found", character_id))
        })?;
        if character.voice_id.trim().is_empty() {
            return Err(PipelineError::precondition(format!(
                "No voice_id for character {}",
                character_id
            )));
        }

        let audio = self
            .tts
            .synthesize(&character.voice_id, text, state.tts.speed)
            .await?;
        let path = self.write_episode_file(&state.id, relative, &audio).await?;
        match self.media.probe_duration_ms(&path).await {
            Ok(duration) => Ok(duration),
            Err(e) => {
                let _ = self.storage.delete(&path).await;
                Err(e.into())
            }
        }
    }
}

pub(crate) fn short_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

pub(crate) fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message);
    pb
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock collaborators and an on-disk fixture shared by the stage tests.

    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::{
        CharacterProfile, Scene, ScriptLine, SettingProfile, TtsLineStatus,
    };
    use crate::services::media::AudioTrack;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default)]
    pub struct MockLlm {
        pub responses: Arc<Mutex<VecDeque<String>>>,
        pub prompts: Arc<Mutex<Vec<String>>>,
    }

    impl MockLlm {
        pub fn respond(&self, answer: &str) {
            self.responses.lock().unwrap().push_back(answer.to_string());
        }

        pub fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat(&self, _system: &str, user: &str, _max_tokens: u32) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("LLM unavailable"))
        }
    }

    #[derive(Clone, Default)]
    pub struct MockTts {
        pub calls: Arc<Mutex<Vec<(String, String, f32)>>>,
        pub fail_on: Arc<Mutex<Option<String>>>,
    }

    impl MockTts {
        pub fn fail_on(&self, text: &str) {
            *self.fail_on.lock().unwrap() = Some(text.to_string());
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TtsClient for MockTts {
        async fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Vec<u8>> {
            if self.fail_on.lock().unwrap().as_deref() == Some(text) {
                return Err(anyhow!("ElevenLabs returned 500"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((voice_id.to_string(), text.to_string(), speed));
            Ok(format!("mp3:{}", text).into_bytes())
        }
    }

    #[derive(Clone, Default)]
    pub struct MockImages {
        pub calls: Arc<Mutex<Vec<(String, Vec<PathBuf>)>>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl MockImages {
        pub fn last_call(&self) -> (String, Vec<PathBuf>) {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ImageClient for MockImages {
        async fn render(&self, prompt: &str, references: &[PathBuf]) -> Result<Vec<u8>> {
            if *self.fail.lock().unwrap() {
                return Err(anyhow!("image service down"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), references.to_vec()));
            Ok(b"\x89PNG".to_vec())
        }
    }

    /// Probes report the fixed duration given to `set_probe`.
    #[derive(Clone, Default)]
    pub struct MockMedia {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub probe_ms: Arc<Mutex<u64>>,
    }

    impl MockMedia {
        pub fn set_probe(&self, ms: u64) {
            *self.probe_ms.lock().unwrap() = ms;
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaRenderer for MockMedia {
        async fn render_still(
            &self,
            image: &Path,
            duration_ms: u64,
            _zoom: (f32, f32),
            output: &Path,
        ) -> Result<()> {
            let name = image.file_name().unwrap().to_string_lossy().to_string();
            self.calls
                .lock()
                .unwrap()
                .push(format!("still {} {}", name, duration_ms));
            std::fs::write(output, b"seg")?;
            Ok(())
        }

        async fn concat(&self, _list_file: &Path, output: &Path) -> Result<()> {
            self.calls.lock().unwrap().push("concat".to_string());
            std::fs::write(output, b"video")?;
            Ok(())
        }

        async fn mix_audio(&self, _video: &Path, tracks: &[AudioTrack], output: &Path) -> Result<()> {
            let delays: Vec<String> = tracks.iter().map(|t| t.delay_ms.to_string()).collect();
            self.calls
                .lock()
                .unwrap()
                .push(format!("mix {}", delays.join(",")));
            std::fs::write(output, b"mixed")?;
            Ok(())
        }

        async fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
            if !path.exists() {
                return Err(anyhow!("no such file {}", path.display()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("probe {}", path.file_name().unwrap().to_string_lossy()));
            Ok(*self.probe_ms.lock().unwrap())
        }
    }

    /// Local storage that can be told to refuse writes of `state.json`.
    #[derive(Debug, Clone, Default)]
    pub struct MockStorage {
        pub fail_state_writes: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Storage for MockStorage {
        async fn read(&self, path: &Path) -> Result<Vec<u8>> {
            NativeStorage::new().read(path).await
        }

        async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
            if *self.fail_state_writes.lock().unwrap() && path.ends_with("state.json") {
                return Err(anyhow!("disk full"));
            }
            NativeStorage::new().write(path, content).await
        }

        async fn delete(&self, path: &Path) -> Result<()> {
            NativeStorage::new().delete(path).await
        }

        async fn exists(&self, path: &Path) -> Result<bool> {
            NativeStorage::new().exists(path).await
        }

        async fn list(&self, prefix: &Path) -> Result<Vec<PathBuf>> {
            NativeStorage::new().list(prefix).await
        }
    }

    pub struct Fixture {
        pub dir: TempDir,
        pub pipeline: EpisodePipeline,
        pub llm: MockLlm,
        pub tts: MockTts,
        pub images: MockImages,
        pub media: MockMedia,
        pub storage: MockStorage,
    }

    impl Fixture {
        /// Temp workspace with a two-character, two-setting registry. Only
        /// `mei` and `park` have reference images on disk.
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            let mut config = Config::parse("llm:\n  provider: ollama\n").unwrap();
            config.episodes_folder = root.join("episodes").display().to_string();
            config.characters_folder = root.join("characters").display().to_string();
            config.settings_folder = root.join("settings").display().to_string();
            config.ensure_directories().unwrap();

            let characters = serde_json::json!({
                "mei": {"role": "curious girl", "personality": "cheerful",
                        "visual": "red jacket", "voice_id": "v_mei",
                        "reference": "characters/mei.png"},
                "lin": {"role": "grandpa", "personality": "patient",
                        "visual": "grey beard", "voice_id": "v_lin",
                        "reference": "characters/lin.png"},
                "crow": {"role": "narrator bird", "personality": "dry",
                         "visual": "black feathers", "voice_id": ""}
            });
            let settings = serde_json::json!({
                "park": {"name_zh": "公园", "name_en": "Park", "reference": "settings/park.png"},
                "home": {"name_zh": "家", "name_en": "Home", "reference": ""}
            });
            std::fs::write(root.join("characters/registry.json"), characters.to_string()).unwrap();
            std::fs::write(root.join("settings/registry.json"), settings.to_string()).unwrap();
            std::fs::write(root.join("characters/mei.png"), b"png").unwrap();
            std::fs::write(root.join("settings/park.png"), b"png").unwrap();

            let llm = MockLlm::default();
            let tts = MockTts::default();
            let images = MockImages::default();
            let media = MockMedia::default();
            media.set_probe(1000);
            let storage = MockStorage::default();
            let pipeline = EpisodePipeline::new(
                config,
                Arc::new(storage.clone()),
                Box::new(llm.clone()),
                Box::new(tts.clone()),
                Box::new(images.clone()),
                Box::new(media.clone()),
            );
            Self {
                dir,
                pipeline,
                llm,
                tts,
                images,
                media,
                storage,
            }
        }

        pub fn fail_state_writes(&self, fail: bool) {
            *self.storage.fail_state_writes.lock().unwrap() = fail;
        }

        pub fn root(&self) -> &Path {
            self.dir.path()
        }

        pub fn episode_file(&self, id: &str, relative: &str) -> PathBuf {
            self.pipeline.episode_dir(id).join(relative)
        }

        pub async fn save(&self, state: &EpisodeState) {
            self.pipeline.store().save(state).await.unwrap();
        }

        pub async fn load(&self, id: &str) -> EpisodeState {
            self.pipeline.episode(id).await.unwrap()
        }

        /// Episode with context loaded and an approved three-line script
        /// (`l1` mei, `l2` lin, `l3` mei), sitting at the TTS stage.
        pub async fn scripted(&self, id: &str) -> EpisodeState {
            let mut state = EpisodeState::new(id);
            state.context.characters = BTreeMap::from([
                (
                    "mei".to_string(),
                    CharacterProfile {
                        role: "curious girl".to_string(),
                        visual: "red jacket".to_string(),
                        voice_id: "v_mei".to_string(),
                        reference: "characters/mei.png".to_string(),
                        ..Default::default()
                    },
                ),
                (
                    "lin".to_string(),
                    CharacterProfile {
                        role: "grandpa".to_string(),
                        visual: "grey beard".to_string(),
                        voice_id: "v_lin".to_string(),
                        reference: "characters/lin.png".to_string(),
                        ..Default::default()
                    },
                ),
            ]);
            state.context.settings = BTreeMap::from([
                (
                    "park".to_string(),
                    SettingProfile {
                        name_zh: "公园".to_string(),
                        name_en: "Park".to_string(),
                        reference: "settings/park.png".to_string(),
                    },
                ),
                (
                    "home".to_string(),
                    SettingProfile {
                        name_zh: "家".to_string(),
                        name_en: "Home".to_string(),
                        reference: String::new(),
                    },
                ),
            ]);
            state.script.seed = "a lost kite".to_string();
            state.script.idea = "Mei loses her kite and grandpa helps.".to_string();
            for (id, who, zh, en) in [
                ("l1", "mei", "我的风筝！", "My kite!"),
                ("l2", "lin", "别担心。", "Don't worry."),
                ("l3", "mei", "谢谢爷爷。", "Thanks, grandpa."),
            ] {
                state.script.lines.push(ScriptLine {
                    id: id.to_string(),
                    character_id: who.to_string(),
                    text_zh: zh.to_string(),
                    text_pinyin: format!("pinyin {}", id),
                    text_en: en.to_string(),
                    ..Default::default()
                });
            }
            state.script.renumber();
            state.script.approved = true;
            state.tts.line_statuses = state
                .script
                .lines
                .iter()
                .map(|l| TtsLineStatus::pending(&l.id))
                .collect();
            state.current_stage = StageId::Tts;
            self.save(&state).await;
            state
        }

        /// `scripted` plus approved audio for every line (1200, 800, 1000ms)
        /// written to disk, sitting at the scenes stage.
        pub async fn voiced(&self, id: &str) -> EpisodeState {
            let mut state = self.scripted(id).await;
            for (status, ms) in state.tts.line_statuses.iter_mut().zip([1200, 800, 1000]) {
                status.audio_file = format!("audio/line_{}.mp3", status.line_id);
                status.duration_ms = ms;
                status.generated = true;
                let path = self.episode_file(id, &status.audio_file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"mp3").unwrap();
            }
            state.tts.approved = true;
            state.current_stage = StageId::Scenes;
            self.save(&state).await;
            state
        }

        /// `voiced` plus two approved scenes with images on disk
        /// (`s1` park: l1 l2, `s2` home: l3), sitting at the stitch stage.
        pub async fn illustrated(&self, id: &str) -> EpisodeState {
            let mut state = self.voiced(id).await;
            for (order, (scene_id, setting, lines)) in [
                ("s1", "park", vec!["l1", "l2"]),
                ("s2", "home", vec!["l3"]),
            ]
            .into_iter()
            .enumerate()
            {
                let image_file = format!("scenes/scene_{}.png", scene_id);
                let path = self.episode_file(id, &image_file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"png").unwrap();
                state.scenes.scenes.push(Scene {
                    id: scene_id.to_string(),
                    order,
                    prompt: format!("{} shot", scene_id),
                    setting_id: setting.to_string(),
                    character_ids: vec!["mei".to_string()],
                    line_ids: lines.into_iter().map(String::from).collect(),
                    image_file,
                    generated: true,
                });
            }
            state.scenes.approved = true;
            state.current_stage = StageId::Stitch;
            self.save(&state).await;
            state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;

    #[tokio::test]
    async fn test_create_episode_numbers_sequentially() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let first = fx.pipeline.create_episode().await?;
        let second = fx.pipeline.create_episode().await?;
        assert_eq!(first.id, "ep_001");
        assert_eq!(second.id, "ep_002");
        assert_eq!(second.current_stage, StageId::Context);
        assert_eq!(fx.pipeline.list_episodes().await?, vec!["ep_001", "ep_002"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_episode_is_not_found() {
        let fx = Fixture::new();
        assert!(fx.pipeline.episode("ep_404").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stages_lists_the_fixed_table() {
        let fx = Fixture::new();
        let names: Vec<&str> = fx.pipeline.stages().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["Context", "Script", "TTS", "Scenes", "Stitch", "Thumbnail", "Complete"]
        );
    }

    #[test]
    fn test_short_id_is_eight_hex_digits() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
