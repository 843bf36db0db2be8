//! yt-dlp metadata model and the user-facing report derived from it.
//!
//! `TrackInfo` mirrors the subset of `--dump-single-json` output the
//! service consumes; `TrackReport` is the search response built from one
//! snapshot. Derived fields are computed here once and never persisted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Bitrate every original artifact is transcoded to.
pub const TARGET_BITRATE_KBPS: u32 = 320;

const UNKNOWN_TITLE: &str = "Unknown title";
const UNKNOWN_UPLOADER: &str = "Unknown uploader";

/// Subset of the yt-dlp info JSON for a single video.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub abr: Option<f64>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
}

impl FormatInfo {
    /// Audio-only means an explicit `vcodec: "none"` and an acodec that is
    /// not "none". A missing vcodec does not count as audio-only.
    pub fn is_audio_only(&self) -> bool {
        self.acodec.as_deref() != Some("none") && self.vcodec.as_deref() == Some("none")
    }
}

/// Picks the audio-only format with the highest average bitrate; the first
/// listed entry wins ties. Formats without a bitrate rank as zero.
pub fn best_audio_format(formats: &[FormatInfo]) -> Option<&FormatInfo> {
    let mut best: Option<&FormatInfo> = None;
    for format in formats {
        if !format.is_audio_only() {
            continue;
        }
        let abr = format.abr.unwrap_or(0.0);
        let best_abr = best.and_then(|current| current.abr).unwrap_or(0.0);
        if best.is_none() || abr > best_abr {
            best = Some(format);
        }
    }
    best
}

/// `m:ss` rendering; minutes are not folded into hours.
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

pub fn quality_label(bitrate_kbps: Option<u32>) -> &'static str {
    match bitrate_kbps {
        Some(abr) if abr >= 256 => "high",
        Some(abr) if abr >= 128 => "medium",
        Some(_) => "basic",
        None => "unknown",
    }
}

/// Size of `duration_seconds` of audio at `bitrate_kbps`, in MiB rounded
/// to two decimals.
pub fn estimated_size_mb(bitrate_kbps: u32, duration_seconds: u64) -> f64 {
    let mib = (bitrate_kbps as f64 * duration_seconds as f64) / 8.0 / 1024.0;
    (mib * 100.0).round() / 100.0
}

/// Converts yt-dlp's `YYYYMMDD` upload date to `YYYY-MM-DD`.
pub fn upload_date_to_iso(raw: &str) -> Option<String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Search response payload: one metadata snapshot plus the fields derived
/// from it and the endpoints serving the artifacts for this id.
#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub video_id: String,
    pub metadata: TrackMetadata,
    pub audio_info: AudioInfo,
    pub download_endpoints: DownloadEndpoints,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackMetadata {
    pub title: String,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioInfo {
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    pub format: String,
    pub target_quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_mb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadEndpoints {
    pub original: String,
    pub enhanced: String,
}

impl TrackReport {
    /// Builds the report from one extraction snapshot. Absent fields stay
    /// absent in the response; an unknown bitrate yields no estimated
    /// size rather than a misleading zero.
    pub fn new(video_id: &str, info: &TrackInfo) -> Self {
        let duration_seconds = info
            .duration
            .filter(|secs| *secs > 0.0)
            .map(|secs| secs.round() as u64);
        let best_audio = best_audio_format(&info.formats);
        let bitrate_kbps = best_audio
            .and_then(|format| format.abr)
            .filter(|abr| *abr > 0.0)
            .map(|abr| abr.round() as u32);
        let codec = best_audio
            .and_then(|format| format.acodec.clone())
            .filter(|codec| codec != "none");
        let estimated = match (bitrate_kbps, duration_seconds) {
            (Some(abr), Some(secs)) => Some(estimated_size_mb(abr, secs)),
            _ => None,
        };

        TrackReport {
            video_id: video_id.to_string(),
            metadata: TrackMetadata {
                title: info.title.clone().unwrap_or_else(|| UNKNOWN_TITLE.into()),
                uploader: info
                    .uploader
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_UPLOADER.into()),
                duration: duration_seconds.map(format_duration),
                duration_seconds,
                thumbnail: info.thumbnail.clone().filter(|url| !url.is_empty()),
                views: info.view_count,
                upload_date: info.upload_date.as_deref().and_then(upload_date_to_iso),
            },
            audio_info: AudioInfo {
                quality: quality_label(bitrate_kbps).to_string(),
                bitrate_kbps,
                codec,
                format: "MP3".into(),
                target_quality: format!("{TARGET_BITRATE_KBPS} kbps"),
                estimated_size_mb: estimated,
            },
            download_endpoints: DownloadEndpoints {
                original: format!("/api/download/{video_id}"),
                enhanced: format!("/api/download/{video_id}/enhanced"),
            },
        }
    }
}
