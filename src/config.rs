#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENHANCE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

/// Resolved runtime settings, passed into components at construction.
/// Nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub enhance_timeout: Duration,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

/// Precedence per value: explicit override, then process env var, then the
/// env file, then the built-in default.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let download_root = overrides
        .download_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_ROOT.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUNEDROP_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("TUNEDROP_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let enhance_timeout_secs = lookup_value("TUNEDROP_ENHANCE_TIMEOUT", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_ENHANCE_TIMEOUT_SECS);
    let ytdlp_bin = lookup_value("TUNEDROP_YTDLP", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string());
    let ffmpeg_bin = lookup_value("TUNEDROP_FFMPEG", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_FFMPEG_BIN.to_string());
    Ok(RuntimeConfig {
        download_root: PathBuf::from(download_root),
        host,
        port,
        enhance_timeout: Duration::from_secs(enhance_timeout_secs),
        ytdlp_bin: PathBuf::from(ytdlp_bin),
        ffmpeg_bin: PathBuf::from(ffmpeg_bin),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses KEY=VALUE lines, tolerating `export ` prefixes, surrounding
/// quotes, comments, and malformed lines. A missing file is an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
