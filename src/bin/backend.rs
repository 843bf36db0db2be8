#![forbid(unsafe_code)]

//! HTTP backend for on-demand audio downloads.
//!
//! A small JSON API: POST a URL to learn what the audio would look like,
//! GET a download endpoint to receive the 320 kbps MP3 (optionally run
//! through the enhancement chain). Artifacts are produced once by the
//! shared `TrackService` and streamed back as attachment downloads.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tunedrop_tools::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use tunedrop_tools::error::TrackError;
use tunedrop_tools::metadata::TrackReport;
use tunedrop_tools::security::ensure_not_root;
use tunedrop_tools::service::{ServedTrack, TrackService};
use tunedrop_tools::store::ArtifactStore;
use tunedrop_tools::tool::{CommandMediaTool, ensure_program_available};

#[derive(Debug, Clone)]
struct BackendArgs {
    config: RuntimeConfig,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut download_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut env_path_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-root=") {
                download_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                env_path_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--download-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-root requires a value"))?;
                    download_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    env_path_override = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let config = resolve_runtime_config(RuntimeOverrides {
            download_root: download_root_override,
            host: host_override.map(|host| host.to_string()),
            port: port_override,
            env_path: env_path_override,
        })?;
        let listen_host = parse_host_arg(&config.host)?;

        Ok(Self {
            config,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUNEDROP_HOST")
}

#[derive(Clone)]
struct AppState {
    service: Arc<TrackService>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }
}

impl From<TrackError> for ApiError {
    fn from(err: TrackError) -> Self {
        let status = if err.is_user_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError {
            status,
            message: err.summary(),
            details: err.details(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => serde_json::json!({
                "error": self.message,
                "details": details,
            }),
            None => serde_json::json!({
                "error": self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "backend=info,tunedrop_tools=info".to_string()),
        )
        .init();

    let BackendArgs {
        config,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let store = ArtifactStore::new(config.download_root.clone());
    store.ensure_root()?;

    ensure_program_available(&config.ytdlp_bin)?;
    ensure_program_available(&config.ffmpeg_bin)?;

    let tool = Arc::new(CommandMediaTool::new(&config));
    let service = Arc::new(TrackService::new(store, tool));
    let state = AppState { service };

    // Browsers need the disposition header exposed to read the filename.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION]);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/search", post(search))
        .route("/api/download/{id}", get(download_original))
        .route("/api/download/{id}/enhanced", get(download_enhanced))
        .fallback(api_fallback)
        .with_state(state)
        .layer(cors);

    let addr = SocketAddr::new(listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn api_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    url: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Json(payload): Json<SearchRequest>,
) -> ApiResult<Json<TrackReport>> {
    let url = payload
        .url
        .ok_or_else(|| ApiError::bad_request("url is required"))?;
    let report = state.service.search(&url).await?;
    Ok(Json(report))
}

async fn download_original(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let track = state.service.original(&id).await?;
    stream_track(track).await
}

async fn download_enhanced(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let track = state.service.enhanced(&id).await?;
    stream_track(track).await
}

/// Streams an on-disk artifact as an attachment download.
async fn stream_track(track: ServedTrack) -> ApiResult<Response> {
    let file = File::open(&track.path)
        .await
        .map_err(|err| ApiError::internal(format!("could not open artifact: {err}")))?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();

    let headers = response.headers_mut();
    if let Some(mime) = MimeGuess::from_path(&track.path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = track.size_bytes.to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = build_content_disposition(&track.display_name).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Plain-ASCII filename for legacy clients plus the RFC 5987 form
/// carrying the full UTF-8 name.
fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.mp3".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::{env, fs};
    use tempfile::tempdir;
    use tunedrop_tools::config::{DEFAULT_DOWNLOAD_ROOT, DEFAULT_HOST, DEFAULT_PORT};
    use tunedrop_tools::error::TrackResult;
    use tunedrop_tools::metadata::{FormatInfo, TrackInfo};
    use tunedrop_tools::tool::MediaTool;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    fn parse_backend_args(env_values: &[(&str, &str)], extra: &[&str]) -> BackendArgs {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(BackendArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    #[derive(Default)]
    struct FakeTool {
        extract_calls: AtomicUsize,
        fail_download: bool,
    }

    #[async_trait]
    impl MediaTool for FakeTool {
        async fn extract(&self, _url: &str) -> TrackResult<TrackInfo> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TrackInfo {
                id: Some("abc123".into()),
                title: Some("Fixture Track".into()),
                uploader: Some("Fixture Channel".into()),
                duration: Some(185.0),
                thumbnail: None,
                view_count: Some(42),
                upload_date: Some("20230115".into()),
                formats: vec![FormatInfo {
                    format_id: Some("251".into()),
                    abr: Some(320.0),
                    acodec: Some("opus".into()),
                    vcodec: Some("none".into()),
                }],
            })
        }

        async fn download(&self, _url: &str, dest: &Path) -> TrackResult<Option<String>> {
            if self.fail_download {
                return Err(TrackError::DownloadFailed("fixture failure".into()));
            }
            fs::write(dest, b"mp3-bytes").unwrap();
            Ok(Some("Fixture Track".into()))
        }

        async fn enhance(&self, _src: &Path, dest: &Path) -> TrackResult<()> {
            fs::write(dest, b"enhanced-bytes").unwrap();
            Ok(())
        }
    }

    fn test_state() -> (tempfile::TempDir, AppState, Arc<FakeTool>) {
        test_state_with(FakeTool::default())
    }

    fn test_state_with(tool: FakeTool) -> (tempfile::TempDir, AppState, Arc<FakeTool>) {
        let temp = tempdir().unwrap();
        let tool = Arc::new(tool);
        let store = ArtifactStore::new(temp.path());
        let service = Arc::new(TrackService::new(store, tool.clone()));
        (temp, AppState { service }, tool)
    }

    #[test]
    fn backend_args_fall_back_to_defaults() {
        let args = parse_backend_args(&[], &[]);
        assert_eq!(
            args.config.download_root,
            PathBuf::from(DEFAULT_DOWNLOAD_ROOT)
        );
        assert_eq!(args.config.port, DEFAULT_PORT);
        assert_eq!(args.listen_host, DEFAULT_HOST.parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_read_env_file_values() {
        let args = parse_backend_args(
            &[
                ("DOWNLOAD_ROOT", "/srv/audio"),
                ("TUNEDROP_PORT", "4242"),
                ("TUNEDROP_HOST", "127.0.0.1"),
            ],
            &[],
        );
        assert_eq!(args.config.download_root, PathBuf::from("/srv/audio"));
        assert_eq!(args.config.port, 4242);
        assert_eq!(args.listen_host, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_override_download_root() {
        let args = parse_backend_args(
            &[("DOWNLOAD_ROOT", "/srv/audio")],
            &["--download-root", "/custom/audio"],
        );
        assert_eq!(args.config.download_root, PathBuf::from("/custom/audio"));
    }

    #[test]
    fn backend_args_override_port() {
        let args = parse_backend_args(&[("TUNEDROP_PORT", "4242")], &["--port=9000"]);
        assert_eq!(args.config.port, 9000);
    }

    #[test]
    fn backend_args_override_host() {
        let args = parse_backend_args(&[("TUNEDROP_HOST", "127.0.0.1")], &["--host", "0.0.0.0"]);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_env_file_flag_points_elsewhere() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("custom.env");
        fs::write(&env_path, "TUNEDROP_PORT=\"7777\"\n").unwrap();
        let args = parse_backend_args(&[], &["--env-file", env_path.to_str().unwrap()]);
        assert_eq!(args.config.port, 7777);
    }

    #[test]
    fn backend_args_reject_unknown_flag() {
        with_env_file(&[], || {
            let err = BackendArgs::from_iter(vec!["--frobnicate".to_string()]).unwrap_err();
            assert!(err.to_string().contains("unknown argument"));
        });
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = super::health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn search_returns_report_json() {
        let (_temp, state, tool) = test_state();
        let Json(report) = super::search(
            State(state),
            Json(SearchRequest {
                url: Some("https://www.youtube.com/watch?v=abc123".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.video_id, "abc123");
        assert_eq!(report.audio_info.quality, "high");
        assert_eq!(report.metadata.duration.as_deref(), Some("3:05"));
        assert_eq!(report.audio_info.estimated_size_mb, Some(7.23));
        assert_eq!(report.download_endpoints.original, "/api/download/abc123");
        assert_eq!(tool.extract_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_without_url_is_bad_request() {
        let (_temp, state, tool) = test_state();
        let err = super::search(State(state), Json(SearchRequest { url: None }))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(tool.extract_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_rejects_invalid_url() {
        let (_temp, state, tool) = test_state();
        let err = super::search(
            State(state),
            Json(SearchRequest {
                url: Some("not-a-url".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(tool.extract_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_sets_attachment_headers() {
        let (_temp, state, _tool) = test_state();
        let response = super::download_original(State(state), AxumPath("abc123".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "9"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment;"), "{disposition}");
        assert!(disposition.contains("Fixture Track.mp3"), "{disposition}");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"mp3-bytes");
    }

    #[tokio::test]
    async fn download_enhanced_names_by_id() {
        let (_temp, state, _tool) = test_state();
        let response = super::download_enhanced(State(state), AxumPath("abc123".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("abc123_enhanced.mp3"), "{disposition}");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"enhanced-bytes");
    }

    #[tokio::test]
    async fn download_invalid_id_is_bad_request() {
        let (_temp, state, _tool) = test_state();
        let err = super::download_original(State(state), AxumPath("a b".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn download_failure_maps_to_internal_error() {
        let (_temp, state, _tool) = test_state_with(FakeTool {
            fail_download: true,
            ..FakeTool::default()
        });
        let err = super::download_original(State(state), AxumPath("abc123".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "failed to download audio");
        assert_eq!(err.details.as_deref(), Some("fixture failure"));
    }

    #[tokio::test]
    async fn api_error_serializes_details_when_present() {
        let response =
            ApiError::from(TrackError::DownloadFailed("yt-dlp exited with status 1".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "failed to download audio");
        assert_eq!(parsed["details"], "yt-dlp exited with status 1");
    }

    #[tokio::test]
    async fn api_error_omits_details_for_user_errors() {
        let response =
            ApiError::from(TrackError::InvalidInput("url is required".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "url is required");
        assert!(parsed.get("details").is_none());
    }

    #[tokio::test]
    async fn api_fallback_is_json_not_found() {
        let response = super::api_fallback().await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "endpoint not found");
    }

    #[test]
    fn content_disposition_quotes_plain_names() {
        assert_eq!(
            build_content_disposition("Fixture Track.mp3"),
            "attachment; filename=\"Fixture Track.mp3\"; filename*=UTF-8''Fixture%20Track.mp3"
        );
    }

    #[test]
    fn content_disposition_keeps_utf8_in_extended_form() {
        let value = build_content_disposition("Café ♫.mp3");
        assert!(value.contains("filename=\"Caf_ _.mp3\""), "{value}");
        assert!(
            value.contains("filename*=UTF-8''Caf%C3%A9%20%E2%99%AB.mp3"),
            "{value}"
        );
        value.parse::<axum::http::HeaderValue>().unwrap();
    }

    #[test]
    fn sanitize_ascii_filename_never_returns_empty() {
        assert_eq!(sanitize_ascii_filename("♫♫♫"), "___");
        assert_eq!(sanitize_ascii_filename("   "), "download.mp3");
        assert_eq!(sanitize_ascii_filename("a b.mp3"), "a b.mp3");
    }
}
