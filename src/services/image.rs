use crate::core::config::{resolve_api_key, Config, OpenAIImageConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Renders `prompt` and returns PNG bytes. Reference images, when given,
    /// keep characters and places visually consistent.
    async fn render(&self, prompt: &str, references: &[PathBuf]) -> Result<Vec<u8>>;
}

pub fn create_image_client(config: &Config) -> Result<Box<dyn ImageClient>> {
    match config.image.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIImageClient::new(&config.image.openai)?)),
        _ => Err(anyhow!("Unknown image provider: {}", config.image.provider)),
    }
}

pub struct OpenAIImageClient {
    api_key: String,
    model: String,
    size: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

impl OpenAIImageClient {
    pub fn new(cfg: &OpenAIImageConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.api_key, "OPENAI_API_KEY")
            .context("OpenAI API key missing (set image.openai.api_key or OPENAI_API_KEY)")?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(180))
            .build()?;
        Ok(Self {
            api_key,
            model: cfg.model.clone(),
            size: cfg.size.clone(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<reqwest::Response> {
        let body = GenerationRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: &self.size,
        };
        Ok(self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?)
    }

    async fn edit(&self, prompt: &str, references: &[PathBuf]) -> Result<reqwest::Response> {
        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("prompt", prompt.to_string())
            .text("n", "1")
            .text("size", self.size.clone());
        for path in references {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read reference image {}", path.display()))?;
            let part = Part::bytes(data)
                .file_name(file_name(path))
                .mime_str(mime_for(path))?;
            form = form.part("image[]", part);
        }
        Ok(self
            .client
            .post(format!("{}/images/edits", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "reference.png".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

fn decode_first_image(body: &str) -> Result<Vec<u8>> {
    let parsed: ImageResponse =
        serde_json::from_str(body).context("Failed to parse image response")?;
    let encoded = parsed
        .data
        .into_iter()
        .find_map(|d| d.b64_json)
        .ok_or_else(|| anyhow!("Image response contained no image data"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[async_trait]
impl ImageClient for OpenAIImageClient {
    async fn render(&self, prompt: &str, references: &[PathBuf]) -> Result<Vec<u8>> {
        debug!("Rendering image with {} reference(s)", references.len());
        let resp = if references.is_empty() {
            self.generate(prompt).await?
        } else {
            self.edit(prompt, references).await?
        };

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI image API error: {}", error_text));
        }
        decode_first_image(&resp.text().await?)
    }
}
