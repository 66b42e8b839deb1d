//! Word arcs exchanged between search passes.

use serde::{Deserialize, Serialize};

use crate::logmath::Score;
use crate::model::{FrameIdx, WordId};
use crate::search::bptbl::BpIdx;

/// One word hypothesis spanning `start_frame..=end_frame`.
///
/// Upstream hints only carry the word and its span. Arcs produced by this
/// pass also carry scores and their backpointer links, so a downstream
/// lattice builder can reconstruct the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordArc {
    pub word: WordId,
    pub start_frame: FrameIdx,
    pub end_frame: FrameIdx,
    pub acoustic_score: Score,
    pub lm_score: Score,
    /// Backpointer index of this exit.
    pub entry: Option<BpIdx>,
    /// Backpointer index of the predecessor exit.
    pub history: Option<BpIdx>,
}

impl WordArc {
    /// Unscored hint from an upstream pass.
    pub fn hint(word: WordId, start_frame: FrameIdx, end_frame: FrameIdx) -> Self {
        Self {
            word,
            start_frame,
            end_frame,
            acoustic_score: 0,
            lm_score: 0,
            entry: None,
            history: None,
        }
    }
}
