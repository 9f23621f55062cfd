//! Walks one episode through every stage from the terminal.

use crate::core::state::StageId;
use crate::pipeline::EpisodePipeline;
use anyhow::{bail, Result};
use log::warn;

pub struct EpisodeWorkflow {
    pipeline: EpisodePipeline,
    unattended: bool,
}

impl EpisodeWorkflow {
    pub fn new(pipeline: EpisodePipeline) -> Self {
        let unattended = pipeline.config().unattended;
        Self {
            pipeline,
            unattended,
        }
    }

    /// Resumes `episode_id`, or starts a new episode when none is given, and
    /// runs it until it is complete or the user stops.
    pub async fn run(&self, episode_id: Option<&str>) -> Result<()> {
        let id = match episode_id {
            Some(id) => id.to_string(),
            None => {
                let state = self.pipeline.create_episode().await?;
                println!("Created episode {}", state.id);
                state.id
            }
        };

        loop {
            let stage = self.pipeline.episode(&id).await?.current_stage;
            if stage == StageId::Complete {
                println!("Episode {} is complete!", id);
                return Ok(());
            }
            println!("== {} stage ==", stage);
            let proceed = match stage {
                StageId::Context => self.context(&id).await?,
                StageId::Script => self.script(&id).await?,
                StageId::Tts => self.tts(&id).await?,
                StageId::Scenes => self.scenes(&id).await?,
                StageId::Stitch => self.stitch(&id).await?,
                StageId::Thumbnail => self.thumbnail(&id).await?,
                StageId::Complete => true,
            };
            if !proceed {
                println!("Stopping as requested. Resume with: seed2episode {}", id);
                return Ok(());
            }
        }
    }

    fn confirm(&self, message: &str) -> bool {
        if self.unattended {
            return true;
        }
        match inquire::Confirm::new(message).with_default(true).prompt() {
            Ok(answer) => answer,
            Err(_) => {
                println!("Error reading input, stopping.");
                false
            }
        }
    }

    async fn context(&self, id: &str) -> Result<bool> {
        let context = self.pipeline.load_context(id).await?;
        println!(
            "Loaded {} characters, {} settings and {} past episodes",
            context.characters.len(),
            context.settings.len(),
            context.episode_history.len()
        );
        if !self.confirm("Approve context?") {
            return Ok(false);
        }
        self.pipeline.approve_context(id).await?;
        Ok(true)
    }

    async fn script(&self, id: &str) -> Result<bool> {
        let mut state = self.pipeline.episode(id).await?;

        if state.script.idea.is_empty() {
            let seed = if !state.script.seed.is_empty() {
                state.script.seed.clone()
            } else if self.unattended {
                bail!("Episode {} has no seed; run once interactively to set one", id);
            } else {
                inquire::Text::new("Story seed:").prompt()?
            };

            let check = self.pipeline.check_seed(id, &seed).await?;
            if check.has_conflicts {
                for conflict in &check.conflicts {
                    println!(
                        "  Similar to {} ({}): {}",
                        conflict.episode_id, conflict.episode_title, conflict.similarity
                    );
                }
                if !check.suggestion.is_empty() {
                    println!("  Suggestion: {}", check.suggestion);
                }
                if !self.confirm("Continue with this seed anyway?") {
                    return Ok(false);
                }
            }

            println!("Developing idea...");
            let draft = self.pipeline.generate_idea(id, &seed).await?;
            println!("{}", draft.idea);
            state = self.pipeline.episode(id).await?;
        }

        if state.script.lines.is_empty() {
            println!("Writing script...");
            self.pipeline.generate_script(id, &state.script.idea).await?;
            state = self.pipeline.episode(id).await?;
        }
        for line in &state.script.lines {
            println!("  {}: {} / {}", line.character_id, line.text_zh, line.text_en);
        }
        if !self.confirm("Approve script?") {
            return Ok(false);
        }
        self.pipeline.approve_script(id).await?;
        Ok(true)
    }

    async fn tts(&self, id: &str) -> Result<bool> {
        println!("Synthesizing audio...");
        self.pipeline.generate_all_lines(id).await?;
        if !self.confirm("Approve audio?") {
            return Ok(false);
        }
        self.pipeline.approve_tts(id).await?;
        Ok(true)
    }

    async fn scenes(&self, id: &str) -> Result<bool> {
        if self.pipeline.episode(id).await?.scenes.scenes.is_empty() {
            println!("Breaking script into scenes...");
            self.pipeline.generate_breakdown(id).await?;
        }
        self.pipeline.generate_all_scene_images(id).await?;
        if !self.confirm("Approve scene images?") {
            return Ok(false);
        }
        self.pipeline.approve_scenes(id).await?;
        Ok(true)
    }

    async fn stitch(&self, id: &str) -> Result<bool> {
        let state = self.pipeline.episode(id).await?;
        if state.timeline.clips.is_empty() {
            self.pipeline.initialize_timeline(id).await?;
        }
        if state.timeline.intro.title_zh.is_empty() {
            match self.pipeline.generate_intro_title(id).await {
                Ok(intro) => println!("Title: {} / {}", intro.title_zh, intro.title_en),
                Err(e) => warn!("Could not generate a title: {}", e),
            }
        }

        println!("Rendering video...");
        let timeline = self.pipeline.export_video(id).await?;
        println!(
            "Video ready: {} ({} ms)",
            self.pipeline.episode_dir(id).join(&timeline.output_file).display(),
            timeline.total_duration_ms
        );
        if !self.confirm("Approve video?") {
            return Ok(false);
        }
        self.pipeline.approve_timeline(id).await?;
        Ok(true)
    }

    async fn thumbnail(&self, id: &str) -> Result<bool> {
        let mut thumbnail = self.pipeline.episode(id).await?.thumbnail;
        if thumbnail.prompt.is_empty() {
            thumbnail = self.pipeline.initialize_thumbnail(id).await?;
        }
        if !thumbnail.generated {
            println!("Rendering thumbnail...");
            self.pipeline.generate_thumbnail(id).await?;
        }
        if !self.confirm("Approve thumbnail?") {
            return Ok(false);
        }
        self.pipeline.approve_thumbnail(id).await?;
        Ok(true)
    }
}
