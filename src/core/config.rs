use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_episodes")]
    pub episodes_folder: String,

    #[serde(default = "default_characters")]
    pub characters_folder: String,

    #[serde(default = "default_settings")]
    pub settings_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "anthropic", "openai", "gemini" or "ollama"
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAIConfig>,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            elevenlabs: ElevenLabsConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_elevenlabs_base_url")]
    pub base_url: String,
    #[serde(default = "default_elevenlabs_model")]
    pub model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_elevenlabs_base_url(),
            model_id: default_elevenlabs_model(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String,
    #[serde(default)]
    pub openai: OpenAIImageConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            openai: OpenAIImageConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIImageConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    pub base_url: Option<String>,
}

impl Default for OpenAIImageConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_image_model(),
            size: default_image_size(),
            base_url: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Apply each scene clip's zoom range as a slow pan/zoom while rendering.
    #[serde(default)]
    pub zoom: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            zoom: false,
        }
    }
}

fn default_episodes() -> String {
    "episodes".to_string()
}
fn default_characters() -> String {
    "characters".to_string()
}
fn default_settings() -> String {
    "settings".to_string()
}
fn default_anthropic_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}
fn default_tts_provider() -> String {
    "elevenlabs".to_string()
}
fn default_elevenlabs_base_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}
fn default_elevenlabs_model() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_stability() -> f32 {
    0.5
}
fn default_similarity_boost() -> f32 {
    0.75
}
fn default_image_provider() -> String {
    "openai".to_string()
}
fn default_image_model() -> String {
    "gpt-image-1".to_string()
}
fn default_image_size() -> String {
    "1536x1024".to_string()
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    24
}

/// Returns the configured key, or the named environment variable when the
/// config leaves it empty.
pub fn resolve_api_key(configured: &str, env_var: &str) -> Option<String> {
    if !configured.trim().is_empty() {
        return Some(configured.trim().to_string());
    }
    std::env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.episodes_folder)?;
        fs::create_dir_all(&self.characters_folder)?;
        fs::create_dir_all(&self.settings_folder)?;
        Ok(())
    }

    pub fn episodes_dir(&self) -> PathBuf {
        PathBuf::from(&self.episodes_folder)
    }

    pub fn characters_dir(&self) -> PathBuf {
        PathBuf::from(&self.characters_folder)
    }

    pub fn settings_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings_folder)
    }

    /// Reference image paths in the character/setting registries are written
    /// relative to the folder that contains those registries.
    pub fn reference_path(&self, registry_dir: &Path, reference: &str) -> PathBuf {
        registry_dir
            .parent()
            .map(|p| p.join(reference))
            .unwrap_or_else(|| PathBuf::from(reference))
    }
}
