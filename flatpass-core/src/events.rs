//! Event types broadcast to engine observers.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `UtteranceEvent` | `SearchEngine::subscribe_utterances` |
//! | `SearchStatusEvent` | `SearchEngine::subscribe_status` |

use serde::{Deserialize, Serialize};

use crate::search::Segment;

// ---------------------------------------------------------------------------
// Utterance events
// ---------------------------------------------------------------------------

/// Emitted once per finished utterance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Utterance index since the engine started.
    pub utterance: u64,
    /// Non-filler words of the best path.
    pub words: Vec<String>,
    /// Best path with per-word frames and scores.
    pub segments: Vec<Segment>,
    /// Frames searched.
    pub frames: usize,
    /// Total path score, `None` when nothing survived the search.
    pub path_score: Option<i64>,
    /// Backpointer entries created (all of them forwarded downstream).
    pub entries: usize,
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStatusEvent {
    pub status: SearchStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Worker running and decoding utterances.
    Decoding,
    /// Stopped by the caller; may be restarted.
    Stopped,
    /// An upstream channel shut down mid-utterance.
    Cancelled,
    /// Unrecoverable error; restart required.
    Error,
}
