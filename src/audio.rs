use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{PipelineError, Result};

/// A time slice of the extracted audio track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioChunk {
    /// 0-based position in the track
    pub index: usize,
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Chunk file, owned by the attempt that created it
    pub path: PathBuf,
}

/// Planned chunk boundaries before any file is written
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSpan {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
}

impl ChunkSpan {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Output of a successful segmentation
#[derive(Debug, Clone)]
pub struct SegmentedAudio {
    /// Intermediate mono 16-bit PCM track
    pub track_path: PathBuf,
    /// Ordered chunks covering the whole track
    pub chunks: Vec<AudioChunk>,
    /// Track duration in seconds
    pub total_duration: f64,
}

/// Turns a source video into fixed-duration audio chunks
#[async_trait]
pub trait MediaSegmenter: Send + Sync {
    /// Segment `source` writing every artifact under `work_dir`. On failure no
    /// partial chunk or intermediate track is left behind.
    async fn segment(&self, source: &Path, work_dir: &Path) -> Result<SegmentedAudio>;
}

/// Split `[0, total_duration)` into `ceil(total / chunk)` contiguous spans
pub fn plan_chunks(total_duration: f64, chunk_duration: Duration) -> Vec<ChunkSpan> {
    let chunk_seconds = chunk_duration.as_secs_f64();
    if !(total_duration > 0.0) || !(chunk_seconds > 0.0) {
        return Vec::new();
    }

    let num_chunks = (total_duration / chunk_seconds).ceil() as usize;
    (0..num_chunks)
        .map(|index| {
            let start_time = index as f64 * chunk_seconds;
            let end_time = (start_time + chunk_seconds).min(total_duration);
            ChunkSpan {
                index,
                start_time,
                end_time,
            }
        })
        .collect()
}

/// ffmpeg-backed segmenter
#[derive(Debug, Clone)]
pub struct AudioExtractor {
    config: AudioConfig,
}

impl AudioExtractor {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    /// Extract a mono 16-bit PCM track at the target sample rate
    pub async fn extract_track(&self, video_path: &Path, output_dir: &Path) -> Result<PathBuf> {
        let audio_path = output_dir.join("audio.wav");

        info!("🎵 Extracting audio track: {}", video_path.display());

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(video_path)
            .args([
                "-vn", // No video stream
                "-acodec", "pcm_s16le", // 16-bit PCM
                "-ar", &self.config.target_sample_rate.to_string(),
                "-ac", &self.config.channels.to_string(),
                "-f", "wav",
            ])
            .arg(&audio_path);

        let output = self.run_tool(cmd, "audio extraction").await?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&audio_path).await;
            return Err(PipelineError::Media(format!(
                "audio extraction failed for {}: {}",
                video_path.display(),
                stderr_tail(&output)
            )));
        }

        Ok(audio_path)
    }

    /// Probe a media file's duration in seconds
    pub async fn probe_duration(&self, media_path: &Path) -> Result<f64> {
        let mut cmd = Command::new(&self.config.ffprobe_path);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(media_path);

        let output = self.run_tool(cmd, "probe").await?;
        if !output.status.success() {
            return Err(PipelineError::Media(format!(
                "ffprobe failed for {}: {}",
                media_path.display(),
                stderr_tail(&output)
            )));
        }

        let probe: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let duration = probe["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(duration)
    }

    /// Cut one span out of the track into its own file
    async fn extract_chunk(&self, track_path: &Path, span: &ChunkSpan, output_dir: &Path) -> Result<AudioChunk> {
        let chunk_path = output_dir.join(format!("chunk_{:04}.wav", span.index));

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-ss", &format!("{:.3}", span.start_time)])
            .args(["-t", &format!("{:.3}", span.duration())])
            .arg("-i")
            .arg(track_path)
            .args([
                "-acodec", "pcm_s16le",
                "-ar", &self.config.target_sample_rate.to_string(),
                "-ac", &self.config.channels.to_string(),
            ])
            .arg(&chunk_path);

        let output = self.run_tool(cmd, "chunk extraction").await?;
        if !output.status.success() {
            return Err(PipelineError::Media(format!(
                "chunk {} extraction failed: {}",
                span.index,
                stderr_tail(&output)
            )));
        }

        let size = tokio::fs::metadata(&chunk_path).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(PipelineError::Media(format!(
                "chunk {} extraction produced an empty file",
                span.index
            )));
        }

        Ok(AudioChunk {
            index: span.index,
            start_time: span.start_time,
            end_time: span.end_time,
            duration: span.duration(),
            path: chunk_path,
        })
    }

    /// Run an external tool; the process is killed if the timeout elapses
    async fn run_tool(&self, mut cmd: Command, label: &str) -> Result<Output> {
        cmd.kill_on_drop(true);
        debug!("Executing command: {:?}", cmd);

        let timeout = self.config.transcode_timeout();
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PipelineError::Media(format!("failed to spawn {}: {}", label, e))),
            Err(_) => Err(PipelineError::Timeout(timeout, label.to_string())),
        }
    }

    async fn segment_inner(
        &self,
        source: &Path,
        work_dir: &Path,
        created: &mut Vec<PathBuf>,
    ) -> Result<SegmentedAudio> {
        let track_path = self.extract_track(source, work_dir).await?;
        created.push(track_path.clone());

        let total_duration = self.probe_duration(&track_path).await?;
        if !(total_duration > 0.0) {
            return Err(PipelineError::Validation(format!(
                "{} has no readable audio (duration {:.2}s)",
                source.display(),
                total_duration
            )));
        }

        let spans = plan_chunks(total_duration, self.config.chunk_duration());
        info!(
            "✂️ Splitting {:.1}s of audio into {} chunks of {}s",
            total_duration,
            spans.len(),
            self.config.chunk_duration().as_secs()
        );

        let pause = Duration::from_millis(self.config.inter_chunk_pause_ms);
        let mut chunks = Vec::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            created.push(work_dir.join(format!("chunk_{:04}.wav", span.index)));
            let chunk = self.extract_chunk(&track_path, span, work_dir).await?;
            debug!(
                "Chunk {} ready: {:.1}s-{:.1}s",
                chunk.index, chunk.start_time, chunk.end_time
            );
            chunks.push(chunk);
        }

        info!("✅ Created {} audio chunks", chunks.len());
        Ok(SegmentedAudio {
            track_path,
            chunks,
            total_duration,
        })
    }
}

#[async_trait]
impl MediaSegmenter for AudioExtractor {
    async fn segment(&self, source: &Path, work_dir: &Path) -> Result<SegmentedAudio> {
        tokio::fs::create_dir_all(work_dir).await?;

        let mut created = Vec::new();
        match self.segment_inner(source, work_dir, &mut created).await {
            Ok(segmented) => Ok(segmented),
            Err(e) => {
                remove_files(&created).await;
                Err(e)
            }
        }
    }
}

/// Best-effort removal of temporary files
pub async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
        }
    }
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().rev().take(3).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}
