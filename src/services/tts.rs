use crate::core::config::{resolve_api_key, Config, ElevenLabsConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use url::Url;

pub const MIN_SPEED: f32 = 0.25;
pub const MAX_SPEED: f32 = 4.0;

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Speaks `text` with `voice_id` and returns the encoded audio (mp3).
    async fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Vec<u8>>;
}

pub fn create_tts_client(config: &Config) -> Result<Box<dyn TtsClient>> {
    match config.tts.provider.as_str() {
        "elevenlabs" => Ok(Box::new(ElevenLabsClient::new(&config.tts.elevenlabs)?)),
        _ => Err(anyhow!("Unknown TTS provider: {}", config.tts.provider)),
    }
}

pub struct ElevenLabsClient {
    api_key: String,
    base_url: Url,
    model_id: String,
    stability: f32,
    similarity_boost: f32,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    speed: f32,
}

impl ElevenLabsClient {
    pub fn new(cfg: &ElevenLabsConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.api_key, "ELEVENLABS_API_KEY").context(
            "ElevenLabs API key missing (set tts.elevenlabs.api_key or ELEVENLABS_API_KEY)",
        )?;
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("Invalid ElevenLabs base URL: {}", cfg.base_url))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            api_key,
            base_url,
            model_id: cfg.model_id.clone(),
            stability: cfg.stability,
            similarity_boost: cfg.similarity_boost,
            client,
        })
    }

    fn speech_url(&self, voice_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("ElevenLabs base URL cannot be a base"))?
            .pop_if_empty()
            .push("text-to-speech")
            .push(voice_id);
        Ok(url)
    }

    fn request<'a>(&'a self, text: &'a str, speed: f32) -> SpeechRequest<'a> {
        SpeechRequest {
            text,
            model_id: &self.model_id,
            voice_settings: VoiceSettings {
                stability: self.stability,
                similarity_boost: self.similarity_boost,
                speed: clamp_speed(speed),
            },
        }
    }
}

#[async_trait]
impl TtsClient for ElevenLabsClient {
    async fn synthesize(&self, voice_id: &str, text: &str, speed: f32) -> Result<Vec<u8>> {
        let url = self.speech_url(voice_id)?;
        debug!("ElevenLabs request to {} ({} chars)", url, text.chars().count());

        let resp = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&self.request(text, speed))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ElevenLabs API error ({}): {}", status, error_text));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(anyhow!("ElevenLabs returned empty audio"));
        }
        Ok(bytes.to_vec())
    }
}
