//! Typed failures for the download/enhance pipeline.
//!
//! Every external-tool failure is converted into one of these variants at
//! the adapter or orchestrator boundary; the HTTP layer only ever sees a
//! `TrackError`, never a raw process or I/O error.

use std::time::Duration;
use thiserror::Error;

pub type TrackResult<T> = std::result::Result<T, TrackError>;

#[derive(Debug, Error)]
pub enum TrackError {
    /// Malformed URL or video id supplied by the caller.
    #[error("{0}")]
    InvalidInput(String),

    /// yt-dlp could not produce metadata for the URL.
    #[error("metadata extraction failed: {0}")]
    ExtractionFailed(String),

    /// yt-dlp exited nonzero or could not be spawned while fetching audio.
    #[error("audio download failed: {0}")]
    DownloadFailed(String),

    /// The download reported success but the expected file is absent.
    #[error("download finished but no audio file was produced for '{0}'")]
    ArtifactMissingAfterDownload(String),

    /// ffmpeg exited nonzero while running the enhancement chain.
    #[error("audio enhancement failed: {0}")]
    EnhancementFailed(String),

    /// ffmpeg exceeded the wall-clock ceiling and was terminated.
    #[error("audio enhancement exceeded the {}s limit", .0.as_secs())]
    EnhancementTimeout(Duration),

    /// The enhancement reported success but the expected file is absent.
    #[error("enhancement finished but no audio file was produced for '{0}'")]
    ArtifactMissingAfterEnhancement(String),
}

impl TrackError {
    /// True for caller mistakes that map to a 4xx status.
    pub fn is_user_error(&self) -> bool {
        matches!(self, TrackError::InvalidInput(_))
    }

    /// Stable one-line summary used as the `error` field of API bodies.
    /// Timeout keeps a summary distinct from generic enhancement failure.
    pub fn summary(&self) -> String {
        match self {
            TrackError::InvalidInput(message) => message.clone(),
            TrackError::ExtractionFailed(_) => "failed to extract video information".into(),
            TrackError::DownloadFailed(_) | TrackError::ArtifactMissingAfterDownload(_) => {
                "failed to download audio".into()
            }
            TrackError::EnhancementFailed(_) | TrackError::ArtifactMissingAfterEnhancement(_) => {
                "failed to enhance audio".into()
            }
            TrackError::EnhancementTimeout(_) => "audio enhancement timed out".into(),
        }
    }

    /// Diagnostic text accompanying the summary, absent for user errors.
    pub fn details(&self) -> Option<String> {
        match self {
            TrackError::InvalidInput(_) => None,
            TrackError::ExtractionFailed(detail)
            | TrackError::DownloadFailed(detail)
            | TrackError::EnhancementFailed(detail) => Some(detail.clone()),
            TrackError::ArtifactMissingAfterDownload(_)
            | TrackError::ArtifactMissingAfterEnhancement(_)
            | TrackError::EnhancementTimeout(_) => Some(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_summary_is_distinct_from_failure() {
        let timeout = TrackError::EnhancementTimeout(Duration::from_secs(300));
        let failure = TrackError::EnhancementFailed("filter graph error".into());
        assert_ne!(timeout.summary(), failure.summary());
        assert!(timeout.details().unwrap().contains("300"));
    }

    #[test]
    fn invalid_input_keeps_message_and_no_details() {
        let err = TrackError::InvalidInput("url must start with http:// or https://".into());
        assert!(err.is_user_error());
        assert_eq!(err.summary(), "url must start with http:// or https://");
        assert!(err.details().is_none());
    }

    #[test]
    fn tool_failures_carry_diagnostics() {
        let err = TrackError::DownloadFailed("yt-dlp exited with status 1".into());
        assert!(!err.is_user_error());
        assert_eq!(err.details().as_deref(), Some("yt-dlp exited with status 1"));
    }
}
