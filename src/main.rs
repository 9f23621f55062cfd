use anyhow::Result;
use seed2episode::core::config::Config;
use seed2episode::core::io::NativeStorage;
use seed2episode::pipeline::EpisodePipeline;
use seed2episode::services::image::create_image_client;
use seed2episode::services::llm::create_llm;
use seed2episode::services::media::FfmpegRenderer;
use seed2episode::services::tts::create_tts_client;
use seed2episode::workflow::EpisodeWorkflow;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    // 2. Initialize collaborators
    let llm = create_llm(&config)?;
    let tts = create_tts_client(&config)?;
    let images = create_image_client(&config)?;
    let media = FfmpegRenderer::new(config.media.clone());

    // 3. Create or resume the episode
    let episode_id = std::env::args().nth(1);
    let pipeline = EpisodePipeline::new(
        config,
        Arc::new(NativeStorage::new()),
        llm,
        tts,
        images,
        Box::new(media),
    );
    EpisodeWorkflow::new(pipeline)
        .run(episode_id.as_deref())
        .await?;

    Ok(())
}
