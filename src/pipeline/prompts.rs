//! Prompt text sent to the language model at each stage.

use crate::core::state::{CharacterProfile, EpisodeState, EpisodeSummary, SettingProfile};
use std::collections::BTreeMap;

pub const SEED_CHECK_SYSTEM: &str =
    "You check story ideas for conflicts with previous episodes. Return JSON only.";
pub const IDEA_SYSTEM: &str =
    "You are a creative writer for a Chinese learning show. Return JSON only.";
pub const SCRIPT_SYSTEM: &str =
    "You are a scriptwriter for a Chinese learning show. Return JSON only.";
pub const BREAKDOWN_SYSTEM: &str =
    "You are a scene breakdown specialist for a Chinese learning show. Return JSON only.";
pub const THUMBNAIL_SYSTEM: &str =
    "You write image generation prompts for YouTube thumbnails. Return only the prompt text.";
pub const INTRO_TITLE_SYSTEM: &str =
    "You name episodes of a Chinese learning show. Return JSON only.";

pub fn format_characters(characters: &BTreeMap<String, CharacterProfile>) -> String {
    characters
        .iter()
        .map(|(id, c)| format!("- {}: {}. {}", id, c.role, c.personality))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_character_visuals(characters: &BTreeMap<String, CharacterProfile>) -> String {
    characters
        .iter()
        .map(|(id, c)| format!("- {}: {}. Visual: {}", id, c.role, c.visual))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_settings(settings: &BTreeMap<String, SettingProfile>) -> String {
    settings
        .iter()
        .map(|(id, s)| format!("- {} ({} / {})", id, s.name_zh, s.name_en))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_history(history: &[EpisodeSummary]) -> String {
    if history.is_empty() {
        return "(No previous episodes)".to_string();
    }
    history
        .iter()
        .map(|ep| format!("- {}: {}: {}", ep.id, ep.title, ep.summary))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_script_lines(state: &EpisodeState) -> String {
    state
        .script
        .lines
        .iter()
        .map(|l| format!("- [{}] {}: {} ({})", l.id, l.character_id, l.text_zh, l.text_en))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn seed_check(state: &EpisodeState, seed: &str) -> String {
    format!(
        r#"Here are the previous episodes of the show:
{history}

A writer proposes this seed for the next episode:
"{seed}"

Decide whether the seed repeats or closely resembles any previous episode.

Return JSON in this format:
{{
  "has_conflicts": true or false,
  "conflicts": [
    {{"episode_id": "ep_001", "episode_title": "...", "similarity": "what overlaps"}}
  ],
  "suggestion": "how to make the seed feel fresh, or an empty string"
}}"#,
        history = format_history(&state.context.episode_history),
        seed = seed
    )
}

pub fn idea(state: &EpisodeState, seed: &str) -> String {
    format!(
        r#"Characters:
{characters}

Settings:
{settings}

Previous episodes:
{history}

Develop this seed into a short episode idea (3 to 5 sentences) that a beginner
Chinese learner can follow. Use only the characters and settings listed above.

Seed: "{seed}"

Return JSON in this format:
{{
  "idea": "...",
  "characters_used": ["character_id", ...],
  "settings_used": ["setting_id", ...]
}}"#,
        characters = format_characters(&state.context.characters),
        settings = format_settings(&state.context.settings),
        history = format_history(&state.context.episode_history),
        seed = seed
    )
}

pub fn script(state: &EpisodeState, idea: &str) -> String {
    format!(
        r#"Characters:
{characters}

Settings:
{settings}

Write the dialogue for this episode:
{idea}

Rules:
- Every line is spoken by one of the characters above, using its id.
- Keep sentences short and natural for beginner learners.
- Give simplified Chinese, tone-marked pinyin and an English translation for every line.
- "direction" is an optional short acting note.

Return JSON in this format:
{{
  "lines": [
    {{
      "character_id": "...",
      "text_zh": "...",
      "text_pinyin": "...",
      "text_en": "...",
      "direction": "..."
    }}
  ]
}}"#,
        characters = format_characters(&state.context.characters),
        settings = format_settings(&state.context.settings),
        idea = idea
    )
}

pub fn scene_breakdown(state: &EpisodeState) -> String {
    format!(
        r#"Script:
{lines}

Settings:
{settings}

Characters:
{characters}

Split the script into visual scenes. Each scene is one illustration that stays
on screen while its lines are spoken. Every script line belongs to exactly one
scene, and scenes follow the script order.

Return JSON in this format:
{{
  "scenes": [
    {{
      "prompt": "detailed image prompt describing the shot",
      "setting_id": "...",
      "character_ids": ["..."],
      "line_ids": ["..."]
    }}
  ]
}}"#,
        lines = format_script_lines(state),
        settings = format_settings(&state.context.settings),
        characters = format_character_visuals(&state.context.characters)
    )
}

pub fn thumbnail(state: &EpisodeState) -> String {
    let characters = state
        .speaking_characters()
        .into_iter()
        .filter_map(|id| {
            state
                .context
                .characters
                .get(id)
                .map(|c| format!("- {}: {}", id, c.visual))
        })
        .collect::<Vec<_>>()
        .join("\n");
    let dialogue = state
        .script
        .lines
        .iter()
        .take(10)
        .map(|l| format!("{}: {}", l.character_id, l.text_en))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Generate a vivid image prompt for a YouTube thumbnail for this Chinese learning show episode.

Episode idea: {idea}

Characters appearing (with visual descriptions):
{characters}

First few lines of dialogue:
{dialogue}

Requirements:
- Capture the central conflict or emotion of the episode
- Include the main characters with their described visual appearances
- Bright, eye-catching composition suitable for a YouTube thumbnail
- Expressive faces and dynamic poses
- Animated/cartoon style consistent with a family learning show
- Do NOT include any text or titles in the image

Return ONLY the image prompt, nothing else."#,
        idea = state.script.idea,
        characters = characters,
        dialogue = dialogue
    )
}

pub fn intro_title(state: &EpisodeState) -> String {
    format!(
        r#"Episode idea: {idea}

Seed: {seed}

Give this episode a short, catchy title in simplified Chinese (at most 10
characters) and its English translation.

Return JSON in this format:
{{"title_zh": "...", "title_en": "..."}}"#,
        idea = state.script.idea,
        seed = state.script.seed
    )
}

/// Appends the episode's art style, if any, to an image prompt.
pub fn with_art_style(prompt: &str, art_style: &str) -> String {
    if art_style.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\nArt style: {}", prompt, art_style.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ScriptLine;

    fn state() -> EpisodeState {
        let mut state = EpisodeState::new("ep_002");
        state.context.characters.insert(
            "mei".to_string(),
            CharacterProfile {
                role: "curious girl".to_string(),
                personality: "cheerful".to_string(),
                visual: "red jacket, pigtails".to_string(),
                ..Default::default()
            },
        );
        state.context.settings.insert(
            "park".to_string(),
            SettingProfile {
                name_zh: "公园".to_string(),
                name_en: "Park".to_string(),
                ..Default::default()
            },
        );
        state.script.idea = "Mei loses her kite in the park.".to_string();
        state.script.lines.push(ScriptLine {
            id: "a1b2c3d4".to_string(),
            character_id: "mei".to_string(),
            text_zh: "我的风筝！".to_string(),
            text_en: "My kite!".to_string(),
            ..Default::default()
        });
        state
    }

    #[test]
    fn test_formatters() {
        let state = state();
        assert_eq!(format_characters(&state.context.characters), "- mei: curious girl. cheerful");
        assert_eq!(format_settings(&state.context.settings), "- park (公园 / Park)");
        assert_eq!(format_history(&[]), "(No previous episodes)");
        assert_eq!(format_script_lines(&state), "- [a1b2c3d4] mei: 我的风筝！ (My kite!)");
    }

    #[test]
    fn test_thumbnail_prompt_mentions_visuals_and_dialogue() {
        let prompt = thumbnail(&state());
        assert!(prompt.contains("- mei: red jacket, pigtails"));
        assert!(prompt.contains("mei: My kite!"));
        assert!(prompt.contains("Mei loses her kite"));
    }

    #[test]
    fn test_seed_check_includes_history() {
        let mut state = state();
        state.context.episode_history.push(EpisodeSummary {
            id: "ep_001".to_string(),
            title: "Dumplings".to_string(),
            summary: "Mei learns to fold dumplings.".to_string(),
            date: String::new(),
        });
        let prompt = seed_check(&state, "a kite festival");
        assert!(prompt.contains("- ep_001: Dumplings: Mei learns to fold dumplings."));
        assert!(prompt.contains("\"a kite festival\""));
    }

    #[test]
    fn test_with_art_style() {
        assert_eq!(with_art_style("A park", ""), "A park");
        assert_eq!(
            with_art_style("A park", " watercolor "),
            "A park\n\nArt style: watercolor"
        );
    }
}
