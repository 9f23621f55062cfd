//! Lays scenes and spoken lines out on a two-track timeline.

use crate::core::state::{ClipKind, Scene, TimelineClip, Track, TtsLineStatus};
use log::debug;

/// Every scene is held this long on top of the audio it carries.
pub const SCENE_PADDING_MS: u64 = 3000;
/// Offset of the first line inside its scene.
pub const AUDIO_LEAD_IN_MS: u64 = 500;
/// Silence between consecutive lines of one scene.
pub const AUDIO_GAP_MS: u64 = 300;
pub const ZOOM_START: f32 = 1.0;
pub const ZOOM_END: f32 = 1.3;

pub fn clip_id(track: Track, order: usize, source_id: &str) -> String {
    let prefix = match track {
        Track::Scenes => "scene",
        Track::Audio => "audio",
    };
    format!("{}_{}_{}", prefix, order, source_id)
}

/// Stored duration of a line's audio, with no probing.
pub fn stored_duration(status: &TtsLineStatus) -> u64 {
    status.duration_ms
}

/// Builds the clip list for `scenes`. Scene durations use the stored line
/// durations; audio clip durations go through `audio_duration`, which lets
/// the caller substitute a probed value for lines stored as zero.
///
/// Lines that are unknown or not generated yet produce no audio clip.
pub fn derive_timeline<F>(
    scenes: &[Scene],
    statuses: &[TtsLineStatus],
    audio_duration: F,
) -> Vec<TimelineClip>
where
    F: Fn(&TtsLineStatus) -> u64,
{
    let mut ordered: Vec<&Scene> = scenes.iter().collect();
    ordered.sort_by_key(|s| s.order);

    let status_of = |line_id: &str| statuses.iter().find(|s| s.line_id == line_id);

    let mut clips = Vec::new();
    let mut scene_starts = Vec::with_capacity(ordered.len());
    let mut cursor = 0u64;
    for (order, scene) in ordered.iter().enumerate() {
        let spoken: u64 = scene
            .line_ids
            .iter()
            .filter_map(|id| status_of(id))
            .map(|s| s.duration_ms)
            .sum();
        let duration = SCENE_PADDING_MS + spoken;
        clips.push(TimelineClip {
            id: clip_id(Track::Scenes, order, &scene.id),
            kind: ClipKind::Scene,
            source_id: scene.id.clone(),
            source_file: scene.image_file.clone(),
            track: Track::Scenes,
            start_ms: cursor,
            duration_ms: duration,
            order,
            zoom_start: ZOOM_START,
            zoom_end: ZOOM_END,
        });
        scene_starts.push(cursor);
        cursor += duration;
    }

    let mut audio_order = 0;
    for (scene, scene_start) in ordered.iter().zip(scene_starts) {
        let mut cursor = scene_start + AUDIO_LEAD_IN_MS;
        for line_id in &scene.line_ids {
            let Some(status) = status_of(line_id).filter(|s| s.generated) else {
                debug!("Scene {}: no generated audio for line {}", scene.id, line_id);
                continue;
            };
            let duration = audio_duration(status);
            clips.push(TimelineClip {
                id: clip_id(Track::Audio, audio_order, line_id),
                kind: ClipKind::Audio,
                source_id: line_id.clone(),
                source_file: status.audio_file.clone(),
                track: Track::Audio,
                start_ms: cursor,
                duration_ms: duration,
                order: audio_order,
                zoom_start: 1.0,
                zoom_end: 1.0,
            });
            audio_order += 1;
            cursor += duration + AUDIO_GAP_MS;
        }
    }

    clips
}

pub fn total_duration(clips: &[TimelineClip]) -> u64 {
    clips.iter().map(TimelineClip::end_ms).max().unwrap_or(0)
}

/// Moves every clip `offset_ms` later.
pub fn shift_clips(clips: &mut [TimelineClip], offset_ms: u64) {
    for clip in clips {
        clip.start_ms += offset_ms;
    }
}
