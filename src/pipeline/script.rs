use super::{prompts, short_id, EpisodePipeline};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{EpisodeState, ScriptLine, StageId, TtsLineStatus};
use crate::services::llm::{generate_json, DEFAULT_MAX_TOKENS};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SCRIPT_MAX_TOKENS: u32 = 16384;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeedConflict {
    #[serde(default)]
    pub episode_id: String,
    #[serde(default)]
    pub episode_title: String,
    #[serde(default)]
    pub similarity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeedCheck {
    #[serde(default)]
    pub has_conflicts: bool,
    #[serde(default)]
    pub conflicts: Vec<SeedConflict>,
    #[serde(default)]
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdeaDraft {
    pub idea: String,
    #[serde(default)]
    pub characters_used: Vec<String>,
    #[serde(default)]
    pub settings_used: Vec<String>,
}

#[derive(Deserialize)]
struct DraftScript {
    #[serde(default)]
    lines: Vec<DraftLine>,
}

#[derive(Deserialize)]
struct DraftLine {
    character_id: String,
    text_zh: String,
    #[serde(default)]
    text_pinyin: String,
    #[serde(default)]
    text_en: String,
    #[serde(default)]
    direction: Option<String>,
}

/// Rebuilds the TTS statuses so there is exactly one per script line, in
/// script order, keeping whatever was already recorded for surviving lines.
pub fn sync_line_statuses(state: &mut EpisodeState) {
    let mut existing = std::mem::take(&mut state.tts.line_statuses);
    state.tts.line_statuses = state
        .script
        .lines
        .iter()
        .map(|line| {
            existing
                .iter()
                .position(|s| s.line_id == line.id)
                .map(|i| existing.swap_remove(i))
                .unwrap_or_else(|| TtsLineStatus::pending(&line.id))
        })
        .collect();
}

/// Lines with generated audio, in script order.
fn generated_prefix(state: &EpisodeState) -> Vec<&ScriptLine> {
    state
        .script
        .lines
        .iter()
        .filter(|l| state.is_line_generated(&l.id))
        .collect()
}

fn check_unique_ids(lines: &[ScriptLine]) -> PipelineResult<()> {
    let mut seen = HashSet::new();
    for line in lines {
        if !seen.insert(line.id.as_str()) {
            return Err(PipelineError::precondition(format!(
                "Duplicate line id {}",
                line.id
            )));
        }
    }
    Ok(())
}

impl EpisodePipeline {
    /// Asks the model whether `seed` repeats an earlier episode. The seed is
    /// stored either way.
    pub async fn check_seed(&self, episode_id: &str, seed: &str) -> PipelineResult<SeedCheck> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;

        let result: SeedCheck = generate_json(
            self.llm.as_ref(),
            prompts::SEED_CHECK_SYSTEM,
            &prompts::seed_check(&state, seed),
            DEFAULT_MAX_TOKENS,
        )
        .await?;

        state.script.seed = seed.to_string();
        self.store.save(&state).await?;
        if result.has_conflicts {
            info!(
                "Episode {}: seed overlaps {} earlier episode(s)",
                episode_id,
                result.conflicts.len()
            );
        }
        Ok(result)
    }

    pub async fn generate_idea(&self, episode_id: &str, seed: &str) -> PipelineResult<IdeaDraft> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;

        let draft: IdeaDraft = generate_json(
            self.llm.as_ref(),
            prompts::IDEA_SYSTEM,
            &prompts::idea(&state, seed),
            DEFAULT_MAX_TOKENS,
        )
        .await?;

        state.script.seed = seed.to_string();
        state.script.idea = draft.idea.clone();
        self.store.save(&state).await?;
        Ok(draft)
    }

    /// Replaces the script with freshly written lines. Rejected while any
    /// line has generated audio. The script must be approved again.
    pub async fn generate_script(
        &self,
        episode_id: &str,
        idea: &str,
    ) -> PipelineResult<Vec<ScriptLine>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;
        if let Some(line) = generated_prefix(&state).first() {
            return Err(PipelineError::precondition(format!(
                "Cannot rewrite the script: line {} already has audio. Revert first.",
                line.id
            )));
        }

        let draft: DraftScript = generate_json(
            self.llm.as_ref(),
            prompts::SCRIPT_SYSTEM,
            &prompts::script(&state, idea),
            SCRIPT_MAX_TOKENS,
        )
        .await?;

        let lines: Vec<ScriptLine> = draft
            .lines
            .into_iter()
            .enumerate()
            .map(|(order, d)| {
                if !state.context.characters.contains_key(&d.character_id) {
                    warn!("Script line uses unknown character {}", d.character_id);
                }
                ScriptLine {
                    id: short_id(),
                    order,
                    character_id: d.character_id,
                    text_zh: d.text_zh,
                    text_pinyin: d.text_pinyin,
                    text_en: d.text_en,
                    direction: d.direction.filter(|s| !s.trim().is_empty()),
                }
            })
            .collect();

        state.script.idea = idea.to_string();
        state.script.lines = lines;
        state.script.approved = false;
        sync_line_statuses(&mut state);
        self.store.save(&state).await?;
        info!("Episode {}: wrote {} script lines", episode_id, state.script.lines.len());
        Ok(state.script.lines)
    }

    /// Replaces the whole line list. Lines with generated audio must keep
    /// their text and stay, in order, at the front of the list.
    pub async fn update_lines(
        &self,
        episode_id: &str,
        lines: Vec<ScriptLine>,
    ) -> PipelineResult<Vec<ScriptLine>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;

        let mut lines = lines;
        for line in &mut lines {
            if line.id.is_empty() {
                line.id = short_id();
            }
        }
        check_unique_ids(&lines)?;

        let generated = generated_prefix(&state);
        for (i, original) in generated.iter().enumerate() {
            let Some(position) = lines.iter().position(|l| l.id == original.id) else {
                return Err(PipelineError::precondition(format!(
                    "Cannot delete line {}: TTS already generated. Revert first.",
                    original.id
                )));
            };
            if !lines[position].same_text(original) {
                return Err(PipelineError::precondition(format!(
                    "Cannot edit line {}: TTS already generated. Revert first.",
                    original.id
                )));
            }
            if position != i {
                return Err(PipelineError::precondition(format!(
                    "Cannot move line {}: TTS already generated. Revert first.",
                    original.id
                )));
            }
        }

        let unvoiced = lines.len() > generated.len();
        state.script.lines = lines;
        state.script.renumber();
        sync_line_statuses(&mut state);
        if unvoiced {
            state.tts.approved = false;
        }
        self.store.save(&state).await?;
        Ok(state.script.lines)
    }

    /// Inserts `line` at `position`. With audio already generated, new lines
    /// may only go after the last generated one. TTS approval is withdrawn.
    pub async fn insert_line(
        &self,
        episode_id: &str,
        position: usize,
        line: ScriptLine,
    ) -> PipelineResult<Vec<ScriptLine>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;

        if position > state.script.lines.len() {
            return Err(PipelineError::precondition(format!(
                "Position {} is past the end of the script ({} lines)",
                position,
                state.script.lines.len()
            )));
        }
        let generated = generated_prefix(&state).len();
        if position < generated {
            return Err(PipelineError::precondition(
                "Can only add lines after the last generated line",
            ));
        }

        let mut line = line;
        if line.id.is_empty() {
            line.id = short_id();
        }
        if state.line(&line.id).is_some() {
            return Err(PipelineError::precondition(format!(
                "Duplicate line id {}",
                line.id
            )));
        }

        state.script.lines.insert(position, line);
        state.script.renumber();
        sync_line_statuses(&mut state);
        state.tts.approved = false;
        self.store.save(&state).await?;
        Ok(state.script.lines)
    }

    pub async fn delete_line(
        &self,
        episode_id: &str,
        line_id: &str,
    ) -> PipelineResult<Vec<ScriptLine>> {
        let _guard = self.store.lock(episode_id).await;
        let mut state = self.load_in_stage(episode_id, StageId::Script).await?;

        if state.line(line_id).is_none() {
            return Err(PipelineError::not_found(format!("Line {} not found", line_id)));
        }
        if state.is_line_generated(line_id) {
            return Err(PipelineError::precondition(format!(
                "Cannot delete line {}: TTS already generated. Revert first.",
                line_id
            )));
        }

        state.script.lines.retain(|l| l.id != line_id);
        state.script.renumber();
        sync_line_statuses(&mut state);
        state.tts.approved = false;
        self.store.save(&state).await?;
        Ok(state.script.lines)
    }

    pub async fn approve_script(&self, episode_id: &str) -> PipelineResult<EpisodeState> {
        self.approve_stage(episode_id, StageId::Script, |state| {
            if state.script.lines.is_empty() {
                return Err(PipelineError::precondition("Cannot approve empty script"));
            }
            state.script.approved = true;
            Ok(())
        })
        .await
    }
}
