use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline position of an episode. The serialized names are what ends up in
/// `state.json`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StageId {
    #[default]
    #[serde(rename = "stage_0_context")]
    Context,
    #[serde(rename = "stage_1_script")]
    Script,
    #[serde(rename = "stage_2_tts")]
    Tts,
    #[serde(rename = "stage_3_scenes")]
    Scenes,
    #[serde(rename = "stage_4_stitch")]
    Stitch,
    #[serde(rename = "stage_5_thumbnail")]
    Thumbnail,
    #[serde(rename = "stage_5_thumbnail_complete")]
    Complete,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Manual,
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EpisodeState {
    pub id: String,
    #[serde(default)]
    pub current_stage: StageId,
    #[serde(default)]
    pub art_style: String,
    #[serde(default)]
    pub context: ContextData,
    #[serde(default)]
    pub script: ScriptData,
    #[serde(default)]
    pub tts: TtsData,
    #[serde(default)]
    pub scenes: ScenesData,
    #[serde(default)]
    pub timeline: TimelineData,
    #[serde(default)]
    pub thumbnail: ThumbnailData,
}

impl EpisodeState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn line(&self, line_id: &str) -> Option<&ScriptLine> {
        self.script.lines.iter().find(|l| l.id == line_id)
    }

    pub fn line_status(&self, line_id: &str) -> Option<&TtsLineStatus> {
        self.tts.line_statuses.iter().find(|s| s.line_id == line_id)
    }

    pub fn is_line_generated(&self, line_id: &str) -> bool {
        self.line_status(line_id).map(|s| s.generated).unwrap_or(false)
    }

    pub fn scene(&self, scene_id: &str) -> Option<&Scene> {
        self.scenes.scenes.iter().find(|s| s.id == scene_id)
    }

    pub fn scene_mut(&mut self, scene_id: &str) -> Option<&mut Scene> {
        self.scenes.scenes.iter_mut().find(|s| s.id == scene_id)
    }

    /// Characters that speak at least one line, in first-appearance order.
    pub fn speaking_characters(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for line in &self.script.lines {
            if !seen.contains(&line.character_id.as_str()) {
                seen.push(&line.character_id);
            }
        }
        seen
    }
}

// --- Context ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CharacterProfile {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub visual: String,
    #[serde(default)]
    pub voice_id: String,
    #[serde(default)]
    pub reference: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SettingProfile {
    #[serde(default)]
    pub name_zh: String,
    #[serde(default)]
    pub name_en: String,
    #[serde(default)]
    pub reference: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EpisodeSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContextData {
    #[serde(default)]
    pub characters: BTreeMap<String, CharacterProfile>,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingProfile>,
    #[serde(default)]
    pub episode_history: Vec<EpisodeSummary>,
}

// --- Script ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScriptLine {
    pub id: String,
    #[serde(default)]
    pub order: usize,
    pub character_id: String,
    pub text_zh: String,
    #[serde(default)]
    pub text_pinyin: String,
    #[serde(default)]
    pub text_en: String,
    #[serde(default)]
    pub direction: Option<String>,
}

impl ScriptLine {
    pub fn same_text(&self, other: &ScriptLine) -> bool {
        self.text_zh == other.text_zh
            && self.text_pinyin == other.text_pinyin
            && self.text_en == other.text_en
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScriptData {
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub idea: String,
    #[serde(default)]
    pub lines: Vec<ScriptLine>,
    #[serde(default)]
    pub approved: bool,
}

impl ScriptData {
    pub fn renumber(&mut self) {
        for (i, line) in self.lines.iter_mut().enumerate() {
            line.order = i;
        }
    }
}

// --- TTS ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TtsLineStatus {
    pub line_id: String,
    #[serde(default)]
    pub audio_file: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub generated: bool,
}

impl TtsLineStatus {
    pub fn pending(line_id: impl Into<String>) -> Self {
        Self {
            line_id: line_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TtsData {
    #[serde(default)]
    pub line_statuses: Vec<TtsLineStatus>,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub approved: bool,
}

impl Default for TtsData {
    fn default() -> Self {
        Self {
            line_statuses: Vec::new(),
            mode: GenerationMode::Manual,
            speed: default_speed(),
            approved: false,
        }
    }
}

fn default_speed() -> f32 {
    1.0
}

// --- Scenes ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Scene {
    pub id: String,
    #[serde(default)]
    pub order: usize,
    pub prompt: String,
    #[serde(default)]
    pub setting_id: String,
    #[serde(default)]
    pub character_ids: Vec<String>,
    #[serde(default)]
    pub line_ids: Vec<String>,
    #[serde(default)]
    pub image_file: String,
    #[serde(default)]
    pub generated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScenesData {
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default)]
    pub approved: bool,
}

impl ScenesData {
    pub fn renumber(&mut self) {
        for (i, scene) in self.scenes.iter_mut().enumerate() {
            scene.order = i;
        }
    }
}

// --- Timeline ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    Scene,
    Audio,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Scenes,
    Audio,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimelineClip {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ClipKind,
    pub source_id: String,
    pub source_file: String,
    pub track: Track,
    #[serde(default)]
    pub start_ms: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub order: usize,
    #[serde(default = "default_zoom")]
    pub zoom_start: f32,
    #[serde(default = "default_zoom")]
    pub zoom_end: f32,
}

impl TimelineClip {
    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.duration_ms
    }
}

fn default_zoom() -> f32 {
    1.0
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IntroData {
    #[serde(default)]
    pub title_zh: String,
    #[serde(default)]
    pub title_en: String,
    #[serde(default)]
    pub character_id: String,
    #[serde(default)]
    pub tts_text: String,
    #[serde(default)]
    pub image_file: String,
    #[serde(default)]
    pub audio_file: String,
    #[serde(default)]
    pub image_uploaded: bool,
    #[serde(default)]
    pub tts_generated: bool,
    #[serde(default)]
    pub audio_duration_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TimelineData {
    #[serde(default)]
    pub clips: Vec<TimelineClip>,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub output_file: String,
    #[serde(default)]
    pub captions_file: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub intro: IntroData,
}

// --- Thumbnail ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ThumbnailData {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub image_file: String,
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub approved: bool,
}
