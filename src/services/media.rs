use crate::core::config::MediaConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// One audio input of a mix, delayed by `delay_ms` from the start.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub path: PathBuf,
    pub delay_ms: u64,
}

#[async_trait]
pub trait MediaRenderer: Send + Sync {
    /// Holds `image` for exactly `duration_ms` as a video segment.
    async fn render_still(
        &self,
        image: &Path,
        duration_ms: u64,
        zoom: (f32, f32),
        output: &Path,
    ) -> Result<()>;

    /// Stream-copies the segments listed in a concat demuxer file.
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<()>;

    /// Lays `tracks` under the video stream of `video`.
    async fn mix_audio(&self, video: &Path, tracks: &[AudioTrack], output: &Path) -> Result<()>;

    async fn probe_duration_ms(&self, path: &Path) -> Result<u64>;
}

pub struct FfmpegRenderer {
    config: MediaConfig,
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl FfmpegRenderer {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    fn frame_filter(&self, duration_ms: u64, zoom: (f32, f32)) -> String {
        let (w, h) = (self.config.width, self.config.height);
        let fit = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2"
        );
        if !self.config.zoom || (zoom.1 - zoom.0).abs() < f32::EPSILON {
            return fit;
        }
        let frames = (duration_ms * u64::from(self.config.fps) / 1000).max(1);
        format!(
            "{fit},zoompan=z={:.3}+{:.3}*on/{frames}:x=iw/2-(iw/zoom/2):y=ih/2-(ih/zoom/2):d=1:s={w}x{h}:fps={}",
            zoom.0,
            zoom.1 - zoom.0,
            self.config.fps
        )
    }

    pub fn still_args(
        &self,
        image: &Path,
        duration_ms: u64,
        zoom: (f32, f32),
        output: &Path,
    ) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loop".to_string(),
            "1".to_string(),
            "-i".to_string(),
            image.display().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-t".to_string(),
            format!("{:.3}", duration_ms as f64 / 1000.0),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-vf".to_string(),
            self.frame_filter(duration_ms, zoom),
            "-r".to_string(),
            self.config.fps.to_string(),
            output.display().to_string(),
        ]
    }

    pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
        [
            "-y", "-f", "concat", "-safe", "0", "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            list_file.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.display().to_string(),
        ])
        .collect()
    }

    /// `[n:a]adelay=d|d[an]` per input, then one `amix` into `[aout]`.
    /// Input 0 is the video.
    pub fn mix_filter(delays_ms: &[u64]) -> String {
        let mut parts: Vec<String> = delays_ms
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{n}:a]adelay={d}|{d}[a{n}]", n = i + 1))
            .collect();
        let inputs: String = (1..=delays_ms.len()).map(|n| format!("[a{}]", n)).collect();
        parts.push(format!(
            "{}amix=inputs={}:dropout_transition=0[aout]",
            inputs,
            delays_ms.len()
        ));
        parts.join(";")
    }

    pub fn mix_args(video: &Path, tracks: &[AudioTrack], output: &Path) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-i".to_string(), video.display().to_string()];
        for track in tracks {
            args.push("-i".to_string());
            args.push(track.path.display().to_string());
        }
        let delays: Vec<u64> = tracks.iter().map(|t| t.delay_ms).collect();
        args.extend(
            [
                "-filter_complex".to_string(),
                Self::mix_filter(&delays),
                "-map".to_string(),
                "0:v".to_string(),
                "-map".to_string(),
                "[aout]".to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
                "-shortest".to_string(),
                output.display().to_string(),
            ],
        );
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        debug!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.lines().last().unwrap_or_default()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MediaRenderer for FfmpegRenderer {
    async fn render_still(
        &self,
        image: &Path,
        duration_ms: u64,
        zoom: (f32, f32),
        output: &Path,
    ) -> Result<()> {
        let args = self.still_args(image, duration_ms, zoom, output);
        self.run(&self.config.ffmpeg, &args).await?;
        Ok(())
    }

    async fn concat(&self, list_file: &Path, output: &Path) -> Result<()> {
        self.run(&self.config.ffmpeg, &Self::concat_args(list_file, output))
            .await?;
        Ok(())
    }

    async fn mix_audio(&self, video: &Path, tracks: &[AudioTrack], output: &Path) -> Result<()> {
        if tracks.is_empty() {
            bail!("No audio tracks to mix");
        }
        self.run(&self.config.ffmpeg, &Self::mix_args(video, tracks, output))
            .await?;
        Ok(())
    }

    async fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
        let args: Vec<String> = ["-v", "quiet", "-print_format", "json", "-show_format"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(path.display().to_string()))
            .collect();
        let stdout = self.run(&self.config.ffprobe, &args).await?;
        parse_probe_duration_ms(&stdout)
            .with_context(|| format!("Failed to read duration of {}", path.display()))
    }
}

pub fn parse_probe_duration_ms(stdout: &[u8]) -> Result<u64> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)?;
    let seconds: f64 = probe
        .format
        .duration
        .ok_or_else(|| anyhow!("ffprobe reported no duration"))?
        .parse()?;
    Ok((seconds * 1000.0) as u64)
}
