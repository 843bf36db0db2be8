#![forbid(unsafe_code)]

//! Shared building blocks for the tunedrop backend: configuration,
//! the artifact cache, the yt-dlp/ffmpeg adapters, and the
//! download/enhance orchestration they compose into.

pub mod config;
pub mod error;
pub mod metadata;
pub mod security;
pub mod service;
pub mod store;
pub mod tool;
