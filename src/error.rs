//! Error types.
//!
//! Per-file problems (`Decode`, `AlreadyFingerprinted`) are reported and the
//! surrounding batch continues. Structural problems (`InvalidTechnique`,
//! `UnsupportedFormat`) propagate to the caller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    /// Unreadable or unsupported audio.
    #[error("could not decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A record with the same name or content hash is already stored.
    #[error("{name} already fingerprinted")]
    AlreadyFingerprinted { name: String },

    /// Fingerprint store path with an extension other than json/db/sqlite.
    #[error("unsupported fingerprint store format: {path} (expected .json, .db or .sqlite)")]
    UnsupportedFormat { path: PathBuf },

    #[error("technique must be fingerprints, correlation or visual, not \"{0}\"")]
    InvalidTechnique(String),

    /// Target range whose start is negative or not before its end.
    #[error("invalid time range {start}..{end}")]
    InvalidRange { start: f64, end: f64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, AlignError>;
