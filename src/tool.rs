//! External tool adapters: yt-dlp for metadata and audio fetch, ffmpeg
//! for the enhancement chain.
//!
//! The orchestrator only sees the [`MediaTool`] trait; tests substitute
//! fakes so no real process is spawned. The production implementation
//! spawns the configured binaries with `kill_on_drop`, so a dropped
//! request future never leaks a child process.

use anyhow::bail;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{TrackError, TrackResult};
use crate::metadata::{TARGET_BITRATE_KBPS, TrackInfo};

/// ffmpeg filter graph for the enhancement pass: loudness normalization,
/// a bass and a presence boost, then gentle compression.
pub const ENHANCE_FILTER_CHAIN: &str = "loudnorm=I=-16:TP=-1.5:LRA=11,\
    equalizer=f=100:t=q:w=1:g=2,\
    equalizer=f=3000:t=q:w=1:g=1.5,\
    acompressor=threshold=0.5:ratio=2:attack=5:release=50";

/// Output sample rate of enhanced artifacts.
pub const ENHANCE_SAMPLE_RATE_HZ: u32 = 48_000;

/// The three external capabilities the orchestrator composes.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Info-only probe for `url`; must not write any media file.
    async fn extract(&self, url: &str) -> TrackResult<TrackInfo>;

    /// Fetches the best audio stream for `url` and transcodes it to an
    /// MP3 at exactly `dest`. Returns the track title when the tool
    /// reports one.
    async fn download(&self, url: &str, dest: &Path) -> TrackResult<Option<String>>;

    /// Runs the enhancement chain over `src`, writing an MP3 to `dest`.
    async fn enhance(&self, src: &Path, dest: &Path) -> TrackResult<()>;
}

/// Production [`MediaTool`] backed by the configured yt-dlp and ffmpeg
/// executables.
#[derive(Debug, Clone)]
pub struct CommandMediaTool {
    ytdlp_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    enhance_timeout: Duration,
}

impl CommandMediaTool {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_binaries(
            config.ytdlp_bin.clone(),
            config.ffmpeg_bin.clone(),
            config.enhance_timeout,
        )
    }

    pub fn with_binaries(
        ytdlp_bin: PathBuf,
        ffmpeg_bin: PathBuf,
        enhance_timeout: Duration,
    ) -> Self {
        CommandMediaTool {
            ytdlp_bin,
            ffmpeg_bin,
            enhance_timeout,
        }
    }
}

#[async_trait]
impl MediaTool for CommandMediaTool {
    async fn extract(&self, url: &str) -> TrackResult<TrackInfo> {
        debug!(url, "probing metadata with yt-dlp");
        let output = Command::new(&self.ytdlp_bin)
            .args([
                "--dump-single-json",
                "--skip-download",
                "--no-warnings",
                "--no-progress",
            ])
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| TrackError::ExtractionFailed(spawn_failure(&self.ytdlp_bin, &err)))?;
        if !output.status.success() {
            return Err(TrackError::ExtractionFailed(process_failure(
                &self.ytdlp_bin,
                &output,
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| TrackError::ExtractionFailed(format!("unreadable yt-dlp output: {err}")))
    }

    async fn download(&self, url: &str, dest: &Path) -> TrackResult<Option<String>> {
        let template = output_template(dest);
        debug!(url, dest = %dest.display(), "fetching audio with yt-dlp");
        let output = Command::new(&self.ytdlp_bin)
            .args([
                "--format",
                "bestaudio/best",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
            ])
            .arg(format!("{TARGET_BITRATE_KBPS}K"))
            .args([
                "--no-playlist",
                "--no-warnings",
                "--no-progress",
                "--print",
                "after_move:title",
                "--output",
            ])
            .arg(&template)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| TrackError::DownloadFailed(spawn_failure(&self.ytdlp_bin, &err)))?;
        if !output.status.success() {
            return Err(TrackError::DownloadFailed(process_failure(
                &self.ytdlp_bin,
                &output,
            )));
        }
        Ok(last_nonempty_line(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn enhance(&self, src: &Path, dest: &Path) -> TrackResult<()> {
        debug!(src = %src.display(), dest = %dest.display(), "running enhancement chain");
        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(src)
            .args(["-af", ENHANCE_FILTER_CHAIN, "-b:a"])
            .arg(format!("{TARGET_BITRATE_KBPS}k"))
            .arg("-ar")
            .arg(ENHANCE_SAMPLE_RATE_HZ.to_string())
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match timeout(self.enhance_timeout, command.output()).await {
            // Dropping the unfinished future kills the child process.
            Err(_) => Err(TrackError::EnhancementTimeout(self.enhance_timeout)),
            Ok(Err(err)) => Err(TrackError::EnhancementFailed(spawn_failure(
                &self.ffmpeg_bin,
                &err,
            ))),
            Ok(Ok(output)) if !output.status.success() => Err(TrackError::EnhancementFailed(
                process_failure(&self.ffmpeg_bin, &output),
            )),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// yt-dlp output template placing the transcoded MP3 exactly at `dest`:
/// the intermediate keeps its own extension, the audio postprocessor
/// then replaces it with `.mp3`.
fn output_template(dest: &Path) -> OsString {
    let mut template = dest.with_extension("").into_os_string();
    template.push(".%(ext)s");
    template
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

fn spawn_failure(program: &Path, err: &std::io::Error) -> String {
    format!("could not run {}: {err}", tool_name(program))
}

fn process_failure(program: &Path, output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail =
        last_nonempty_line(&stderr).unwrap_or_else(|| "no diagnostic output".to_string());
    format!("{} exited with {}: {detail}", tool_name(program), output.status)
}

fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(str::to_string)
}

/// Startup probe: runs `<program> --version` and fails when the binary
/// is missing or broken.
pub fn ensure_program_available(program: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!("{} is not usable ({status})", program.display()),
        Err(err) => bail!("{} is not available: {err}", program.display()),
    }
}
