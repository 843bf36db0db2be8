//! Download/enhance orchestration.
//!
//! `TrackService` answers the three request types (search, original,
//! enhanced) with a cache-first policy: serve the artifact when it is
//! already on disk, otherwise produce it while holding the per-(id, kind)
//! flight lock so concurrent requests collapse into one production
//! attempt. Production always goes through a staging path and an atomic
//! rename, so readers never observe partial files and a failed attempt
//! leaves nothing behind.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use url::Url;

use crate::error::{TrackError, TrackResult};
use crate::metadata::TrackReport;
use crate::store::{Artifact, ArtifactKind, ArtifactStore};
use crate::tool::MediaTool;

const MAX_VIDEO_ID_LEN: usize = 64;

/// An artifact ready to be streamed, with the filename the client should
/// save it under.
#[derive(Debug, Clone)]
pub struct ServedTrack {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub display_name: String,
}

type FlightKey = (String, ArtifactKind);

pub struct TrackService {
    store: ArtifactStore,
    tool: Arc<dyn MediaTool>,
    /// One async mutex per (id, kind), created on first use and never
    /// removed. Entries are tiny; ids come from clients that already
    /// passed validation.
    flights: Mutex<HashMap<FlightKey, Arc<AsyncMutex<()>>>>,
}

impl TrackService {
    pub fn new(store: ArtifactStore, tool: Arc<dyn MediaTool>) -> Self {
        TrackService {
            store,
            tool,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn flight_lock(&self, id: &str, kind: ArtifactKind) -> Arc<AsyncMutex<()>> {
        let mut flights = self.flights.lock();
        flights.entry((id.to_string(), kind)).or_default().clone()
    }

    /// Probes metadata for a caller-supplied URL. Never touches the
    /// artifact store.
    pub async fn search(&self, raw_url: &str) -> TrackResult<TrackReport> {
        let url = validate_source_url(raw_url)?;
        let info = self.tool.extract(url.as_str()).await?;
        let video_id = info.id.clone().ok_or_else(|| {
            TrackError::ExtractionFailed("metadata did not include a video id".into())
        })?;
        info!(video_id, "metadata extracted");
        Ok(TrackReport::new(&video_id, &info))
    }

    /// Serves the original MP3 for `id`, producing it on first request.
    /// A fresh download is named after the fetched title; cache hits use
    /// the id-based filename.
    pub async fn original(&self, id: &str) -> TrackResult<ServedTrack> {
        validate_video_id(id)?;
        let lock = self.flight_lock(id, ArtifactKind::Original);
        let _flight = lock.lock().await;

        let cached = self.store.locate(id, ArtifactKind::Original);
        if cached.exists {
            info!(id, "serving cached original");
            return Ok(served(cached, ArtifactKind::Original.file_name(id)));
        }

        let title = self.produce_original(id).await?;
        let artifact = self.store.locate(id, ArtifactKind::Original);
        if !artifact.exists {
            return Err(TrackError::ArtifactMissingAfterDownload(id.to_string()));
        }
        let display_name = match title {
            Some(title) if !title.trim().is_empty() => format!("{}.mp3", title.trim()),
            _ => ArtifactKind::Original.file_name(id),
        };
        info!(id, size = artifact.size_bytes, "original ready");
        Ok(served(artifact, display_name))
    }

    /// Serves the enhanced MP3 for `id`, producing the original first
    /// when needed. Enhancement failure leaves the original cached for a
    /// later retry.
    pub async fn enhanced(&self, id: &str) -> TrackResult<ServedTrack> {
        validate_video_id(id)?;
        let lock = self.flight_lock(id, ArtifactKind::Enhanced);
        let _flight = lock.lock().await;

        let cached = self.store.locate(id, ArtifactKind::Enhanced);
        if cached.exists {
            info!(id, "serving cached enhanced");
            return Ok(served(cached, ArtifactKind::Enhanced.file_name(id)));
        }

        let original = self.ensure_original(id).await?;
        self.produce_enhanced(id, &original).await?;
        let artifact = self.store.locate(id, ArtifactKind::Enhanced);
        if !artifact.exists {
            return Err(TrackError::ArtifactMissingAfterEnhancement(id.to_string()));
        }
        info!(id, size = artifact.size_bytes, "enhanced ready");
        Ok(served(artifact, ArtifactKind::Enhanced.file_name(id)))
    }

    /// Returns the Original artifact, producing it under its own flight
    /// lock when absent. Lock order is Enhanced then Original; nothing
    /// takes them in the other order.
    async fn ensure_original(&self, id: &str) -> TrackResult<Artifact> {
        let lock = self.flight_lock(id, ArtifactKind::Original);
        let _flight = lock.lock().await;
        let cached = self.store.locate(id, ArtifactKind::Original);
        if cached.exists {
            return Ok(cached);
        }
        self.produce_original(id).await?;
        let artifact = self.store.locate(id, ArtifactKind::Original);
        if artifact.exists {
            Ok(artifact)
        } else {
            Err(TrackError::ArtifactMissingAfterDownload(id.to_string()))
        }
    }

    /// Downloads into staging and promotes. Caller holds the Original
    /// flight lock. Returns the fetched title when the tool reports one.
    async fn produce_original(&self, id: &str) -> TrackResult<Option<String>> {
        let url = watch_url(id);
        let staging = self.store.staging_path(id, ArtifactKind::Original);
        self.store.discard_staging(id, ArtifactKind::Original);
        info!(id, "downloading original audio");
        let title = match self.tool.download(&url, &staging).await {
            Ok(title) => title,
            Err(err) => {
                self.store.discard_staging(id, ArtifactKind::Original);
                return Err(err);
            }
        };
        if !staging.exists() {
            return Err(TrackError::ArtifactMissingAfterDownload(id.to_string()));
        }
        self.store
            .promote(id, ArtifactKind::Original)
            .map_err(|err| TrackError::DownloadFailed(format!("could not finalize artifact: {err}")))?;
        Ok(title)
    }

    /// Enhances into staging and promotes. Caller holds the Enhanced
    /// flight lock and guarantees `original` exists.
    async fn produce_enhanced(&self, id: &str, original: &Artifact) -> TrackResult<()> {
        let staging = self.store.staging_path(id, ArtifactKind::Enhanced);
        self.store.discard_staging(id, ArtifactKind::Enhanced);
        info!(id, "enhancing audio");
        if let Err(err) = self.tool.enhance(&original.path, &staging).await {
            self.store.discard_staging(id, ArtifactKind::Enhanced);
            warn!(id, %err, "enhancement failed, original stays cached");
            return Err(err);
        }
        if !staging.exists() {
            return Err(TrackError::ArtifactMissingAfterEnhancement(id.to_string()));
        }
        self.store
            .promote(id, ArtifactKind::Enhanced)
            .map_err(|err| {
                TrackError::EnhancementFailed(format!("could not finalize artifact: {err}"))
            })
    }
}

fn served(artifact: Artifact, display_name: String) -> ServedTrack {
    ServedTrack {
        path: artifact.path,
        size_bytes: artifact.size_bytes,
        display_name,
    }
}

/// Video ids become filename stems and URL parameters, so only short
/// `[A-Za-z0-9_-]` tokens are accepted.
pub fn validate_video_id(id: &str) -> TrackResult<()> {
    if id.is_empty() || id.len() > MAX_VIDEO_ID_LEN {
        return Err(TrackError::InvalidInput(format!(
            "video id must be 1-{MAX_VIDEO_ID_LEN} characters"
        )));
    }
    if !id
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
    {
        return Err(TrackError::InvalidInput(
            "video id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

/// Accepts only absolute http/https URLs.
pub fn validate_source_url(raw: &str) -> TrackResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TrackError::InvalidInput("url is required".into()));
    }
    let url = Url::parse(trimmed)
        .map_err(|_| TrackError::InvalidInput("url must be a valid absolute URL".into()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TrackError::InvalidInput("url must use http or https".into()));
    }
    Ok(url)
}

/// Canonical source URL reconstructed from a video id.
pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}
