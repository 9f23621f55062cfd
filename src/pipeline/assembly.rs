//! Renders a timeline's clip list into one video file.

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{TimelineClip, Track};
use crate::services::media::{AudioTrack, MediaRenderer};
use anyhow::Context;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub const OUTPUT_FILE: &str = "output.mp4";
const CONCAT_LIST: &str = "_concat.txt";
const CONCAT_VIDEO: &str = "_concat.mp4";

fn segment_name(index: usize) -> String {
    format!("_seg_{}.mp4", index)
}

/// Renders `clips` into `<episode_dir>/<output_name>`. Clip source files are
/// resolved against `episode_dir`. Scratch files are removed whether or not
/// rendering succeeds.
pub async fn assemble(
    renderer: &dyn MediaRenderer,
    clips: &[TimelineClip],
    episode_dir: &Path,
    output_name: &str,
) -> PipelineResult<PathBuf> {
    let mut scene_clips: Vec<&TimelineClip> =
        clips.iter().filter(|c| c.track == Track::Scenes).collect();
    let mut audio_clips: Vec<&TimelineClip> =
        clips.iter().filter(|c| c.track == Track::Audio).collect();
    scene_clips.sort_by_key(|c| c.start_ms);
    audio_clips.sort_by_key(|c| c.start_ms);

    if scene_clips.is_empty() {
        return Err(PipelineError::assembly("No scene clips to render"));
    }
    for clip in &scene_clips {
        let image = episode_dir.join(&clip.source_file);
        if clip.source_file.is_empty() || !image.is_file() {
            return Err(PipelineError::assembly(format!(
                "Scene image not found: {}",
                image.display()
            )));
        }
    }

    let result = render(renderer, &scene_clips, &audio_clips, episode_dir, output_name).await;
    cleanup(episode_dir, scene_clips.len()).await;
    result
}

async fn render(
    renderer: &dyn MediaRenderer,
    scene_clips: &[&TimelineClip],
    audio_clips: &[&TimelineClip],
    episode_dir: &Path,
    output_name: &str,
) -> PipelineResult<PathBuf> {
    let output = episode_dir.join(output_name);

    let mut list = Vec::with_capacity(scene_clips.len());
    for (i, clip) in scene_clips.iter().enumerate() {
        let segment = episode_dir.join(segment_name(i));
        renderer
            .render_still(
                &episode_dir.join(&clip.source_file),
                clip.duration_ms,
                (clip.zoom_start, clip.zoom_end),
                &segment,
            )
            .await
            .with_context(|| format!("Failed to render scene clip {}", clip.id))?;
        list.push(format!("file '{}'", segment_name(i)));
    }

    let list_file = episode_dir.join(CONCAT_LIST);
    tokio::fs::write(&list_file, list.join("\n")).await?;
    let concat_video = episode_dir.join(CONCAT_VIDEO);
    renderer.concat(&list_file, &concat_video).await?;

    let mut tracks = Vec::new();
    for clip in audio_clips {
        let path = episode_dir.join(&clip.source_file);
        if clip.source_file.is_empty() || !path.is_file() {
            warn!("Skipping audio clip {}: {} is missing", clip.id, path.display());
            continue;
        }
        tracks.push(AudioTrack {
            path,
            delay_ms: clip.start_ms,
        });
    }

    if tracks.is_empty() {
        tokio::fs::rename(&concat_video, &output)
            .await
            .with_context(|| format!("Failed to move video to {}", output.display()))?;
    } else {
        renderer.mix_audio(&concat_video, &tracks, &output).await?;
    }

    info!(
        "Rendered {} scenes and {} audio clips into {}",
        scene_clips.len(),
        tracks.len(),
        output.display()
    );
    Ok(output)
}

async fn cleanup(episode_dir: &Path, segments: usize) {
    let scratch = (0..segments)
        .map(segment_name)
        .chain([CONCAT_LIST.to_string(), CONCAT_VIDEO.to_string()]);
    for name in scratch {
        // Missing files are expected after a partial render.
        let _ = tokio::fs::remove_file(episode_dir.join(name)).await;
    }
}
