use super::assembly::{self, OUTPUT_FILE};
use super::captions::generate_srt;
use super::timeline::{derive_timeline, shift_clips, total_duration, AUDIO_LEAD_IN_MS};
use super::{prompts, EpisodePipeline};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{
    ClipKind, EpisodeState, IntroData, StageId, TimelineClip, TimelineData, Track,
};
use crate::services::llm::{generate_json, DEFAULT_MAX_TOKENS};
use log::{info, warn};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const CAPTIONS_FILE: &str = "captions.srt";
const INTRO_AUDIO_FILE: &str = "intro/intro_audio.mp3";
/// Intro length when no intro line has been voiced.
const INTRO_SILENT_MS: u64 = 3000;
/// Hold after the intro line before the episode starts.
const INTRO_TAIL_MS: u64 = 1000;

/// Partial edit of a single clip; `None` fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClipUpdate {
    pub start_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub zoom_start: Option<f32>,
    pub zoom_end: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntroUpdate {
    pub title_zh: Option<String>,
    pub title_en: Option<String>,
    pub character_id: Option<String>,
    pub tts_text: Option<String>,
}

#[derive(Deserialize)]
struct IntroTitle {
    title_zh: String,
    #[serde(default)]
    title_en: String,
}

/// Length of the intro segment, or 0 when the episode has no intro image.
pub fn intro_duration(intro: &IntroData) -> u64 {
    if !intro.image_uploaded || intro.image_file.is_empty() {
        0
    } else if intro.tts_generated {
        intro.audio_duration_ms + INTRO_TAIL_MS
    } else {
        INTRO_SILENT_MS
    }
}

/// Prepends the intro to a copy of `clips`, pushing every main clip back by
/// the intro length. Returns the clips to render and that offset.
pub fn with_intro(clips: &[TimelineClip], intro: &IntroData) -> (Vec<TimelineClip>, u64) {
    let offset = intro_duration(intro);
    if offset == 0 {
        return (clips.to_vec(), 0);
    }

    let mut all = vec![TimelineClip {
        id: "intro_scene".to_string(),
        kind: ClipKind::Scene,
        source_id: "intro".to_string(),
        source_file: intro.image_file.clone(),
        track: Track::Scenes,
        start_ms: 0,
        duration_ms: offset,
        order: 0,
        zoom_start: 1.0,
        zoom_end: 1.0,
    }];
    if intro.tts_generated && !intro.audio_file.is_empty() {
        all.push(TimelineClip {
            id: "intro_audio".to_string(),
            kind: ClipKind::Audio,
            source_id: "intro".to_string(),
            source_file: intro.audio_file.clone(),
            track: Track::Audio,
            start_ms: AUDIO_LEAD_IN_MS,
            duration_ms: intro.audio_duration_ms,
            order: 0,
            zoom_start: 1.0,
            zoom_end: 1.0,
        });
    }
    let mut main = clips.to_vec();
    shift_clips(&mut main, offset);
    all.extend(main);
    (all, offset)
}

fn check_unique_clip_ids(clips: &[TimelineClip]) -> PipelineResult<()> {
    let mut seen = HashSet::new();
    match clips.iter().find(|c| !seen.insert(c.id.as_str())) {
        Some(dup) => Err(PipelineError::precondition(format!(
            "Duplicate clip id {}",
            dup.id
        ))),
        None => Ok(()),
    }
}

fn clip_not_found(clip_id: &str) -> PipelineError {
    PipelineError::not_found(format!("Clip {} not found", clip_id))
}

impl EpisodePipeline {
    /// Lays scenes and voiced lines out as a fresh clip list. Lines recorded
    /// without a duration are probed for their audio clip.
    pub async fn initialize_timeline(&self, episode_id: &str) -> PipelineResult<TimelineData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        if !StageId::Tts.can_exit(&state) {
            return Err(PipelineError::precondition(
                "Every line needs approved audio before building the timeline",
            ));
        }

        let mut probed = HashMap::new();
        for status in &state.tts.line_statuses {
            if !status.generated || status.duration_ms > 0 || status.audio_file.is_empty() {
                continue;
            }
            let path = self.episode_dir(episode_id).join(&status.audio_file);
            if !matches!(self.storage.exists(&path).await, Ok(true)) {
                continue;
            }
            let duration = match self.media.probe_duration_ms(&path).await {
                Ok(ms) => ms,
                Err(e) => {
                    warn!("Could not probe {}: {:#}", path.display(), e);
                    0
                }
            };
            probed.insert(status.line_id.clone(), duration);
        }

        let clips = derive_timeline(
            &state.scenes.scenes,
            &state.tts.line_statuses,
            |status| probed.get(&status.line_id).copied().unwrap_or(status.duration_ms),
        );
        let timeline = &mut state.timeline;
        timeline.total_duration_ms = total_duration(&clips);
        timeline.clips = clips;
        timeline.output_file.clear();
        timeline.captions_file.clear();
        timeline.approved = false;
        self.store.save(&state).await?;
        info!(
            "Episode {}: timeline with {} clips, {} ms",
            episode_id,
            state.timeline.clips.len(),
            state.timeline.total_duration_ms
        );
        Ok(state.timeline)
    }

    pub async fn update_clips(
        &self,
        episode_id: &str,
        clips: Vec<TimelineClip>,
    ) -> PipelineResult<Vec<TimelineClip>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        check_unique_clip_ids(&clips)?;

        state.timeline.total_duration_ms = total_duration(&clips);
        state.timeline.clips = clips;
        state.timeline.approved = false;
        self.store.save(&state).await?;
        Ok(state.timeline.clips)
    }

    pub async fn update_clip(
        &self,
        episode_id: &str,
        clip_id: &str,
        update: ClipUpdate,
    ) -> PipelineResult<TimelineClip> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;

        let clip = state
            .timeline
            .clips
            .iter_mut()
            .find(|c| c.id == clip_id)
            .ok_or_else(|| clip_not_found(clip_id))?;
        if let Some(start_ms) = update.start_ms {
            clip.start_ms = start_ms;
        }
        if let Some(duration_ms) = update.duration_ms {
            clip.duration_ms = duration_ms;
        }
        if let Some(zoom) = update.zoom_start {
            clip.zoom_start = zoom;
        }
        if let Some(zoom) = update.zoom_end {
            clip.zoom_end = zoom;
        }
        let clip = clip.clone();

        state.timeline.total_duration_ms = total_duration(&state.timeline.clips);
        state.timeline.approved = false;
        self.store.save(&state).await?;
        Ok(clip)
    }

    /// Edits intro text fields. The voiced text and its speaker are frozen
    /// while intro audio exists.
    pub async fn update_intro(&self, episode_id: &str, update: IntroUpdate) -> PipelineResult<IntroData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        let intro = &state.timeline.intro;

        let voice_changed = update
            .character_id
            .as_ref()
            .is_some_and(|c| *c != intro.character_id)
            || update.tts_text.as_ref().is_some_and(|t| *t != intro.tts_text);
        if voice_changed && intro.tts_generated {
            return Err(PipelineError::precondition(
                "Intro audio already generated. Revert first.",
            ));
        }
        if let Some(character_id) = update.character_id.as_deref() {
            if !character_id.is_empty() && !state.context.characters.contains_key(character_id) {
                return Err(PipelineError::not_found(format!(
                    "Character {} not found",
                    character_id
                )));
            }
        }

        let intro = &mut state.timeline.intro;
        if let Some(title_zh) = update.title_zh {
            intro.title_zh = title_zh;
        }
        if let Some(title_en) = update.title_en {
            intro.title_en = title_en;
        }
        if let Some(character_id) = update.character_id {
            intro.character_id = character_id;
        }
        if let Some(tts_text) = update.tts_text {
            intro.tts_text = tts_text;
        }
        self.store.save(&state).await?;
        Ok(state.timeline.intro)
    }

    /// Copies `source` into the episode as the intro image.
    pub async fn set_intro_image(&self, episode_id: &str, source: &Path) -> PipelineResult<IntroData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;

        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let image_file = format!("intro/intro_image.{}", ext);
        self.storage
            .copy(source, &self.episode_dir(episode_id).join(&image_file))
            .await?;

        let previous = std::mem::replace(&mut state.timeline.intro.image_file, image_file);
        state.timeline.intro.image_uploaded = true;
        self.store.save(&state).await?;
        if previous != state.timeline.intro.image_file {
            self.delete_episode_file(episode_id, &previous).await;
        }
        Ok(state.timeline.intro)
    }

    /// Names the episode. The Chinese title also becomes the intro line when
    /// none has been written yet.
    pub async fn generate_intro_title(&self, episode_id: &str) -> PipelineResult<IntroData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;

        let title: IntroTitle = generate_json(
            self.llm.as_ref(),
            prompts::INTRO_TITLE_SYSTEM,
            &prompts::intro_title(&state),
            DEFAULT_MAX_TOKENS,
        )
        .await?;

        let intro = &mut state.timeline.intro;
        if intro.tts_text.trim().is_empty() && !intro.tts_generated {
            intro.tts_text = title.title_zh.clone();
        }
        intro.title_zh = title.title_zh;
        intro.title_en = title.title_en;
        self.store.save(&state).await?;
        Ok(state.timeline.intro)
    }

    pub async fn generate_intro_tts(&self, episode_id: &str) -> PipelineResult<IntroData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        let intro = &state.timeline.intro;

        if intro.tts_generated {
            return Err(PipelineError::precondition(
                "Intro audio already generated. Revert first.",
            ));
        }
        if intro.character_id.is_empty() {
            return Err(PipelineError::precondition("Choose an intro character first"));
        }
        if intro.tts_text.trim().is_empty() {
            return Err(PipelineError::precondition("Intro text is empty"));
        }

        let duration_ms = self
            .voice_line(&state, &intro.character_id, &intro.tts_text, INTRO_AUDIO_FILE)
            .await?;
        let intro = &mut state.timeline.intro;
        intro.audio_file = INTRO_AUDIO_FILE.to_string();
        intro.audio_duration_ms = duration_ms;
        intro.tts_generated = true;
        self.store.save(&state).await?;
        info!("Episode {}: voiced intro ({} ms)", episode_id, duration_ms);
        Ok(state.timeline.intro)
    }

    pub async fn revert_intro_tts(&self, episode_id: &str) -> PipelineResult<IntroData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;

        let intro = &mut state.timeline.intro;
        let audio_file = std::mem::take(&mut intro.audio_file);
        intro.audio_duration_ms = 0;
        intro.tts_generated = false;
        self.store.save(&state).await?;
        self.delete_episode_file(episode_id, &audio_file).await;
        Ok(state.timeline.intro)
    }

    /// Writes `captions.srt` for the current clips and returns its text.
    pub async fn export_captions(&self, episode_id: &str) -> PipelineResult<String> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        let srt = self.write_captions(&state).await?;
        state.timeline.captions_file = CAPTIONS_FILE.to_string();
        self.store.save(&state).await?;
        Ok(srt)
    }

    async fn write_captions(&self, state: &EpisodeState) -> PipelineResult<String> {
        let offset = intro_duration(&state.timeline.intro);
        let srt = generate_srt(&state.timeline.clips, &state.script.lines, offset);
        self.write_episode_file(&state.id, CAPTIONS_FILE, srt.as_bytes())
            .await?;
        Ok(srt)
    }

    /// Renders the timeline, with the intro in front of it, into
    /// `output.mp4` and writes the matching captions.
    pub async fn export_video(&self, episode_id: &str) -> PipelineResult<TimelineData> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Stitch).await?;
        if state.timeline.clips.is_empty() {
            return Err(PipelineError::precondition("No clips in timeline"));
        }

        let (clips, offset) = with_intro(&state.timeline.clips, &state.timeline.intro);
        if offset > 0 {
            info!("Episode {}: adding {} ms intro", episode_id, offset);
        }
        assembly::assemble(
            self.media.as_ref(),
            &clips,
            &self.episode_dir(episode_id),
            OUTPUT_FILE,
        )
        .await?;
        self.write_captions(&state).await?;

        let timeline = &mut state.timeline;
        timeline.output_file = OUTPUT_FILE.to_string();
        timeline.captions_file = CAPTIONS_FILE.to_string();
        timeline.total_duration_ms = total_duration(&timeline.clips);
        self.store.save(&state).await?;
        Ok(state.timeline)
    }

    pub async fn approve_timeline(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Stitch, |state| {
            if state.timeline.output_file.is_empty() {
                return Err(PipelineError::precondition(
                    "Must export video before approving",
                ));
            }
            state.timeline.approved = true;
            Ok(())
        })
        .await
    }
}
