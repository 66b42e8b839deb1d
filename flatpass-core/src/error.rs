use std::path::PathBuf;

use thiserror::Error;

use crate::model::FrameIdx;

/// All errors produced by flatpass-core.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed pronunciation for word {word:?}: {reason}")]
    MalformedPronunciation { word: String, reason: String },

    #[error("invalid HMM definition: {0}")]
    InvalidHmm(String),

    #[error("language model does not contain {word}, recognition would fail")]
    MissingFinishWord { word: String },

    #[error("failed to read vocabulary map {path}: {source}")]
    VocabMapIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vocabulary map line {line}: {reason}")]
    VocabMapParse { line: usize, reason: String },

    #[error("search cancelled by pipeline shutdown")]
    Cancelled,

    #[error("acoustic frame {0} reported ready but has no scores")]
    MissingFrame(FrameIdx),

    #[error("search engine is already running")]
    AlreadyRunning,

    #[error("search engine is not running")]
    NotRunning,

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SearchError {
    /// `true` for the cancellation outcome, which callers treat differently
    /// from every other failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SearchError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
