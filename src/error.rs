// Error types surfaced by the engine
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The host refused to start output. Recoverable by an explicit user play.
    #[error("playback was blocked by the host")]
    PlaybackBlocked,

    /// A stem's content handle is stale or missing and must be re-selected.
    #[error("source unavailable: {path}")]
    SourceUnavailable { path: String },

    #[error("song '{grouping_key}' has no playable stems")]
    EmptySession { grouping_key: String },

    /// A newer load or a teardown started while this one was opening players
    #[error("load of '{grouping_key}' was superseded")]
    LoadSuperseded { grouping_key: String },

    /// Only ever logged; a failed tick heals on the next one.
    #[error("drift correction failed for stem '{label}': {reason}")]
    DriftCorrectionFailure { label: String, reason: String },

    #[error("no song is loaded")]
    NoSongLoaded,

    #[error("song index {index} is out of range (library holds {len})")]
    SongIndexOutOfRange { index: usize, len: usize },

    #[error("song '{grouping_key}' has no stem labelled '{label}'")]
    UnknownStem { grouping_key: String, label: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by a single player primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("start rejected: {0}")]
    Blocked(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("seek failed: {0}")]
    Seek(String),

    #[error("output device error: {0}")]
    Device(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
