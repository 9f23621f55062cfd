//! SRT caption rendering with Chinese, pinyin and English text per entry.

use crate::core::state::{ClipKind, ScriptLine, TimelineClip};
use std::collections::HashMap;

/// `HH:MM:SS,mmm`
pub fn srt_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1_000;
    let millis = ms % 1_000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

/// One entry per audio clip whose source line still exists, in start order.
/// `offset_ms` is added to every timestamp.
pub fn generate_srt(clips: &[TimelineClip], lines: &[ScriptLine], offset_ms: u64) -> String {
    let lines_by_id: HashMap<&str, &ScriptLine> =
        lines.iter().map(|l| (l.id.as_str(), l)).collect();

    let mut audio: Vec<&TimelineClip> = clips.iter().filter(|c| c.kind == ClipKind::Audio).collect();
    audio.sort_by_key(|c| c.start_ms);

    let entries: Vec<String> = audio
        .into_iter()
        .filter_map(|clip| lines_by_id.get(clip.source_id.as_str()).map(|line| (clip, line)))
        .enumerate()
        .map(|(i, (clip, line))| {
            format!(
                "{}\n{} --> {}\n{}\n{}\n{}",
                i + 1,
                srt_timestamp(clip.start_ms + offset_ms),
                srt_timestamp(clip.end_ms() + offset_ms),
                line.text_zh,
                line.text_pinyin,
                line.text_en
            )
        })
        .collect();

    entries.join("\n\n") + "\n"
}
