use super::script::sync_line_statuses;
use super::{progress_bar, EpisodePipeline};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{EpisodeState, GenerationMode, StageId, TtsLineStatus};
use crate::services::tts::clamp_speed;
use log::{info, warn};

fn audio_file_for(line_id: &str) -> String {
    format!("audio/line_{}.mp3", line_id)
}

fn line_index(state: &EpisodeState, line_id: &str) -> PipelineResult<usize> {
    state
        .script
        .lines
        .iter()
        .position(|l| l.id == line_id)
        .ok_or_else(|| PipelineError::not_found(format!("Line {} not found", line_id)))
}

fn first_pending_line(state: &EpisodeState) -> Option<&str> {
    state
        .script
        .lines
        .iter()
        .find(|l| !state.is_line_generated(&l.id))
        .map(|l| l.id.as_str())
}

fn set_status(state: &mut EpisodeState, status: TtsLineStatus) {
    match state
        .tts
        .line_statuses
        .iter_mut()
        .find(|s| s.line_id == status.line_id)
    {
        Some(existing) => *existing = status,
        None => state.tts.line_statuses.push(status),
    }
}

impl EpisodePipeline {
    /// Makes sure every script line has a status, keeping recorded ones.
    pub async fn initialize_tts(&self, episode_id: &str) -> PipelineResult<Vec<TtsLineStatus>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;
        sync_line_statuses(&mut state);
        self.store.save(&state).await?;
        Ok(state.tts.line_statuses)
    }

    /// Speaks one line. Lines are voiced strictly in script order, so every
    /// earlier line must already have audio.
    pub async fn generate_line(
        &self,
        episode_id: &str,
        line_id: &str,
    ) -> PipelineResult<TtsLineStatus> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;
        sync_line_statuses(&mut state);

        let index = line_index(&state, line_id)?;
        if let Some(prior) = state.script.lines[..index]
            .iter()
            .find(|l| !state.is_line_generated(&l.id))
        {
            return Err(PipelineError::precondition(format!(
                "Must generate line {} first",
                prior.id
            )));
        }
        if state.is_line_generated(line_id) {
            return Err(PipelineError::precondition(format!(
                "Line {} already has audio. Revert first.",
                line_id
            )));
        }

        let status = self.synthesize_line(&state, index).await?;
        set_status(&mut state, status.clone());
        self.store.save(&state).await?;
        info!("Episode {}: voiced line {}", episode_id, line_id);
        Ok(status)
    }

    /// Voices every line without audio, in order. State is saved after each
    /// line, so a failure keeps the lines done so far and a rerun resumes.
    pub async fn generate_all_lines(&self, episode_id: &str) -> PipelineResult<Vec<TtsLineStatus>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;
        sync_line_statuses(&mut state);

        let pending: Vec<usize> = (0..state.script.lines.len())
            .filter(|&i| !state.is_line_generated(&state.script.lines[i].id))
            .collect();
        let pb = progress_bar(pending.len(), "Voicing lines");
        for index in pending {
            match self.synthesize_line(&state, index).await {
                Ok(status) => {
                    set_status(&mut state, status);
                    self.store.save(&state).await?;
                    pb.inc(1);
                }
                Err(e) => {
                    pb.abandon_with_message("Voicing stopped");
                    warn!(
                        "Episode {}: line {} failed: {}",
                        episode_id, state.script.lines[index].id, e
                    );
                    return Err(e);
                }
            }
        }
        pb.finish_with_message("Voicing complete");
        Ok(state.tts.line_statuses)
    }

    async fn synthesize_line(&self, state: &EpisodeState, index: usize) -> PipelineResult<TtsLineStatus> {
        let line = &state.script.lines[index];
        let audio_file = audio_file_for(&line.id);
        let duration_ms = self
            .voice_line(state, &line.character_id, &line.text_zh, &audio_file)
            .await?;
        Ok(TtsLineStatus {
            line_id: line.id.clone(),
            audio_file,
            duration_ms,
            generated: true,
        })
    }

    /// Drops a line's audio. Only the last voiced line can be reverted.
    pub async fn revert_line(&self, episode_id: &str, line_id: &str) -> PipelineResult<TtsLineStatus> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;

        let index = line_index(&state, line_id)?;
        if let Some(later) = state.script.lines[index + 1..]
            .iter()
            .find(|l| state.is_line_generated(&l.id))
        {
            return Err(PipelineError::precondition(format!(
                "Must revert line {} first",
                later.id
            )));
        }

        let audio_file = state
            .line_status(line_id)
            .map(|s| s.audio_file.clone())
            .unwrap_or_default();
        let status = TtsLineStatus::pending(line_id);
        set_status(&mut state, status.clone());
        state.tts.approved = false;
        sync_line_statuses(&mut state);
        self.store.save(&state).await?;
        self.delete_episode_file(episode_id, &audio_file).await;
        info!("Episode {}: reverted line {}", episode_id, line_id);
        Ok(status)
    }

    pub async fn set_tts_mode(&self, episode_id: &str, mode: GenerationMode) -> PipelineResult<GenerationMode> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;
        state.tts.mode = mode;
        self.store.save(&state).await?;
        Ok(mode)
    }

    /// Sets the speaking rate used for lines voiced from now on.
    pub async fn set_tts_speed(&self, episode_id: &str, speed: f32) -> PipelineResult<f32> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Tts).await?;
        state.tts.speed = clamp_speed(speed);
        self.store.save(&state).await?;
        Ok(state.tts.speed)
    }

    pub async fn approve_tts(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Tts, |state| {
            sync_line_statuses(state);
            if let Some(line_id) = first_pending_line(state) {
                return Err(PipelineError::precondition(format!(
                    "Line {} does not have TTS generated",
                    line_id
                )));
            }
            state.tts.approved = true;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ScriptLine;
    use crate::pipeline::testing::Fixture;

    fn generated(state: &EpisodeState) -> Vec<bool> {
        state.tts.line_statuses.iter().map(|s| s.generated).collect()
    }

    #[tokio::test]
    async fn test_tts_requires_approved_script() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let mut state = fx.scripted("ep_001").await;
        state.script.approved = false;
        fx.save(&state).await;

        let err = fx.pipeline.generate_line("ep_001", "l1").await.unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("TTS"));
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_line_extends_prefix_by_one() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.scripted("ep_001").await;
        fx.media.set_probe(1234);

        let status = fx.pipeline.generate_line("ep_001", "l1").await?;
        assert_eq!(status.audio_file, "audio/line_l1.mp3");
        assert_eq!(status.duration_ms, 1234);
        assert!(fx.episode_file("ep_001", "audio/line_l1.mp3").exists());

        let calls = fx.tts.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("v_mei".to_string(), "我的风筝！".to_string(), 1.0)]);
        assert_eq!(generated(&fx.load("ep_001").await), vec![true, false, false]);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_line_out_of_order_is_rejected() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.scripted("ep_001").await;

        let err = fx.pipeline.generate_line("ep_001", "l3").await.unwrap_err();
        assert!(err.to_string().contains("Must generate line l1 first"));
        assert_eq!(fx.tts.call_count(), 0);

        fx.pipeline.generate_line("ep_001", "l1").await?;
        let again = fx.pipeline.generate_line("ep_001", "l1").await.unwrap_err();
        assert!(again.is_precondition());
        assert!(fx.pipeline.generate_line("ep_001", "zz").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_character_without_voice() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let mut state = fx.scripted("ep_001").await;
        state.script.lines[0].character_id = "ghost".to_string();
        fx.save(&state).await;
        assert!(fx.pipeline.generate_line("ep_001", "l1").await.unwrap_err().is_not_found());

        state.script.lines[0].character_id = "mei".to_string();
        state.context.characters.get_mut("mei").unwrap().voice_id = String::new();
        fx.save(&state).await;
        let err = fx.pipeline.generate_line("ep_001", "l1").await.unwrap_err();
        assert!(err.to_string().contains("No voice_id for character mei"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_synthesis_leaves_state_unchanged() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let before = fx.scripted("ep_001").await;
        fx.tts.fail_on("我的风筝！");

        let err = fx.pipeline.generate_line("ep_001", "l1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(_)));
        assert_eq!(fx.load("ep_001").await, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_all_resumes_after_failure() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.scripted("ep_001").await;
        fx.tts.fail_on("别担心。");

        assert!(fx.pipeline.generate_all_lines("ep_001").await.is_err());
        assert_eq!(generated(&fx.load("ep_001").await), vec![true, false, false]);

        *fx.tts.fail_on.lock().unwrap() = None;
        let statuses = fx.pipeline.generate_all_lines("ep_001").await?;
        assert!(statuses.iter().all(|s| s.generated));
        // l1 is not voiced twice.
        assert_eq!(fx.tts.call_count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_revert_only_from_the_end() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.voiced("ep_001").await;

        let err = fx.pipeline.revert_line("ep_001", "l2").await.unwrap_err();
        assert!(err.to_string().contains("Must revert line l3 first"));

        let status = fx.pipeline.revert_line("ep_001", "l3").await?;
        assert_eq!(status, TtsLineStatus::pending("l3"));
        assert!(!fx.episode_file("ep_001", "audio/line_l3.mp3").exists());

        let state = fx.load("ep_001").await;
        assert_eq!(generated(&state), vec![true, true, false]);
        assert!(!state.tts.approved);

        fx.pipeline.revert_line("ep_001", "l2").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_script_edits_withdraw_audio_approval() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.illustrated("ep_001").await;
        let line = ScriptLine {
            id: "l4".to_string(),
            character_id: "lin".to_string(),
            text_zh: "再见。".to_string(),
            ..Default::default()
        };

        fx.pipeline.insert_line("ep_001", 3, line).await?;
        let state = fx.load("ep_001").await;
        assert!(!state.tts.approved);
        assert!(!StageId::Tts.can_exit(&state));
        assert!(!StageId::Scenes.can_enter(&state));
        let err = fx.pipeline.initialize_timeline("ep_001").await.unwrap_err();
        assert!(err.is_precondition());

        fx.pipeline.generate_line("ep_001", "l4").await?;
        fx.pipeline.approve_tts("ep_001").await?;
        fx.pipeline.delete_line("ep_001", "l4").await.unwrap_err();
        fx.pipeline.revert_line("ep_001", "l4").await?;
        fx.pipeline.approve_tts("ep_001").await.unwrap_err();
        fx.pipeline.delete_line("ep_001", "l4").await?;
        assert!(!fx.load("ep_001").await.tts.approved);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_revert_keeps_audio() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.voiced("ep_001").await;
        fx.fail_state_writes(true);

        let err = fx.pipeline.revert_line("ep_001", "l3").await.unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(_)));
        assert!(fx.episode_file("ep_001", "audio/line_l3.mp3").exists());
        assert!(fx.load("ep_001").await.is_line_generated("l3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_speed_is_clamped_and_used() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.scripted("ep_001").await;
        assert_eq!(fx.pipeline.set_tts_speed("ep_001", 9.0).await?, 4.0);
        assert_eq!(fx.pipeline.set_tts_speed("ep_001", 0.8).await?, 0.8);
        fx.pipeline.generate_line("ep_001", "l1").await?;
        assert_eq!(fx.tts.calls.lock().unwrap()[0].2, 0.8);

        fx.pipeline.set_tts_mode("ep_001", GenerationMode::Auto).await?;
        assert_eq!(fx.load("ep_001").await.tts.mode, GenerationMode::Auto);
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_keeps_existing_statuses() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let mut state = fx.voiced("ep_001").await;
        state.tts.line_statuses.truncate(1);
        fx.save(&state).await;

        let statuses = fx.pipeline.initialize_tts("ep_001").await?;
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].duration_ms, 1200);
        assert_eq!(statuses[2], TtsLineStatus::pending("l3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_approve_tts_needs_every_line() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let before = fx.scripted("ep_001").await;

        let err = fx.pipeline.approve_tts("ep_001").await.unwrap_err();
        assert!(err.to_string().contains("Line l1 does not have TTS generated"));
        assert_eq!(fx.load("ep_001").await, before);

        fx.pipeline.generate_all_lines("ep_001").await?;
        let state = fx.pipeline.approve_tts("ep_001").await?;
        assert!(state.tts.approved);
        assert_eq!(state.current_stage, StageId::Scenes);
        Ok(())
    }
}
