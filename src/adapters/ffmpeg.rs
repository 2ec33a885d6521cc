//! ffmpeg/ffprobe subprocess helpers.
//!
//! All audio probing and cutting shells out to the local ffmpeg install.
//! Chunks are encoded at 16 kHz mono 32 kbps mp3, which keeps them well
//! under transcription-service size limits.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;

fn ffmpeg_binary() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn ffprobe_binary() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

/// Duration of a media file in seconds
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let output = Command::new(ffprobe_binary())
        .args(["-v", "error", "-show_format", "-of", "json"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed for {}: {}", path.display(), stderr.trim());
    }

    let probe: ProbeOutput =
        serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe JSON")?;

    probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .with_context(|| format!("ffprobe reported no duration for {}", path.display()))
}

/// Extract the audio track of a video container into a new temp mp3.
///
/// The returned file deletes itself on drop.
pub async fn extract_audio(video: &Path) -> Result<NamedTempFile> {
    let out = NamedTempFile::with_suffix(".mp3").context("Failed to create temp audio file")?;

    let output = Command::new(ffmpeg_binary())
        .arg("-y")
        .arg("-i")
        .arg(video)
        .args(["-vn", "-acodec", "libmp3lame", "-ar", "16000", "-ac", "1", "-b:a", "32k"])
        .arg(out.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run ffmpeg for audio extraction")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg audio extraction failed: {}", stderr.trim());
    }

    Ok(out)
}

/// Cut `[start, start+duration)` out of an audio file into a new temp mp3
pub async fn cut_chunk(source: &Path, start_secs: f64, duration_secs: f64) -> Result<NamedTempFile> {
    let out = NamedTempFile::with_suffix(".mp3").context("Failed to create temp chunk file")?;

    let output = Command::new(ffmpeg_binary())
        .arg("-y")
        .args(["-ss", &format!("{:.3}", start_secs)])
        .args(["-t", &format!("{:.3}", duration_secs)])
        .arg("-i")
        .arg(source)
        .args(["-vn", "-acodec", "libmp3lame", "-ar", "16000", "-ac", "1", "-b:a", "32k"])
        .arg(out.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run ffmpeg for chunk cut")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffmpeg chunk cut failed at {:.1}s+{:.1}s: {}",
            start_secs,
            duration_secs,
            stderr.trim()
        );
    }

    Ok(out)
}

/// Detect low-energy regions with ffmpeg's silencedetect filter.
///
/// Returns the midpoint of each detected silence, sorted ascending. These
/// are the candidate cut points for the segmenter.
pub async fn detect_silence_points(path: &Path) -> Result<Vec<f64>> {
    let output = Command::new(ffmpeg_binary())
        .arg("-i")
        .arg(path)
        .args(["-af", "silencedetect=noise=-30dB:d=0.5", "-f", "null", "-"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run ffmpeg silencedetect")?;

    // silencedetect reports on stderr regardless of exit status
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(parse_silence_points(&stderr))
}

/// Parse `silence_start` / `silence_end` pairs from silencedetect output
fn parse_silence_points(stderr: &str) -> Vec<f64> {
    let mut points = Vec::new();
    let mut pending_start: Option<f64> = None;

    for line in stderr.lines() {
        if let Some(value) = field_after(line, "silence_start:") {
            pending_start = value.parse::<f64>().ok();
        } else if let Some(value) = field_after(line, "silence_end:") {
            if let (Some(start), Ok(end)) = (pending_start.take(), value.parse::<f64>()) {
                points.push((start + end) / 2.0);
            }
        }
    }

    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    points
}

fn field_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.split(marker)
        .nth(1)
        .map(str::trim)
        .and_then(|rest| rest.split_whitespace().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_silence_points() {
        let stderr = "\
[silencedetect @ 0x1] silence_start: 10.5\n\
[silencedetect @ 0x1] silence_end: 11.5 | silence_duration: 1.0\n\
[silencedetect @ 0x1] silence_start: 100.0\n\
[silencedetect @ 0x1] silence_end: 102.0 | silence_duration: 2.0\n";

        let points = parse_silence_points(stderr);
        assert_eq!(points, vec![11.0, 101.0]);
    }

    #[test]
    fn test_parse_ignores_unpaired_start() {
        let stderr = "[silencedetect @ 0x1] silence_start: 5.0\n";
        assert!(parse_silence_points(stderr).is_empty());
    }
}
