//! Backpointer table: append-only storage of word exits.
//!
//! ## Layout
//!
//! ```text
//! entries      [e0 e1 e2 | e3 e4 | e5 ...]      one per (word, exit frame)
//! frame_starts  ^0        ^3      ^5            first entry of each frame
//! rc_scores    [e0: rc0 rc1 rc2 | e1: rc0 | ...] one slot per right context
//! retired       ──────────►                     forwarded downstream
//! ```
//!
//! While a frame is open each word has at most one entry in it. A second exit
//! of the same word in the same frame overwrites the entry's score and history
//! when better, and always records its own right-context slot. Entries below
//! the oldest index still referenced by a live path can never change again and
//! are retired (forwarded) in index order.

use std::collections::VecDeque;
use std::ops::Range;

use serde::Serialize;

use crate::logmath::{better_than, Score, WORST_SCORE};
use crate::model::{Dictionary, FrameIdx, PhoneId, WordId};

/// Index of an entry in the table.
pub type BpIdx = usize;

/// One word exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpointerEntry {
    pub word: WordId,
    /// Exit frame.
    pub frame: FrameIdx,
    /// Path score in the normalization domain of `frame`.
    pub score: Score,
    pub history: Option<BpIdx>,
    /// Last non-filler word on the path (the word itself unless a filler).
    pub real_word: WordId,
    pub prev_real_word: Option<WordId>,
    pub last_phone: PhoneId,
    /// `None` for single-phone words.
    pub second_last_phone: Option<PhoneId>,
    #[serde(skip)]
    rc_start: usize,
    #[serde(skip)]
    rc_len: usize,
}

/// Oldest backpointer any live path may still extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// A live path has no history yet.
    UtteranceStart,
    Entry(BpIdx),
    /// No live paths.
    Empty,
}

impl Watermark {
    /// Fold in a history referenced by a live state.
    pub fn include(self, history: Option<BpIdx>) -> Self {
        match (self, history) {
            (Watermark::UtteranceStart, _) | (_, None) => Watermark::UtteranceStart,
            (Watermark::Entry(a), Some(b)) => Watermark::Entry(a.min(b)),
            (Watermark::Empty, Some(b)) => Watermark::Entry(b),
        }
    }
}

/// One edge of the exit lattice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatticeEdge {
    pub entry: BpIdx,
    pub history: Option<BpIdx>,
    pub word: WordId,
    pub start_frame: FrameIdx,
    pub end_frame: FrameIdx,
    pub path_score: i64,
}

#[derive(Debug, Default)]
pub struct BackpointerTable {
    entries: Vec<BackpointerEntry>,
    rc_scores: Vec<Score>,
    frame_starts: Vec<BpIdx>,
    /// Cumulative normalization applied up to each frame.
    norm: Vec<i64>,
    open: Vec<Option<BpIdx>>,
    open_words: Vec<WordId>,
    retired: BpIdx,
    /// Start frames of closed, unretired entries, increasing in both index
    /// and frame; the front is their minimum.
    pending_sf: VecDeque<(BpIdx, FrameIdx)>,
    /// Entries already folded into `pending_sf`.
    scanned: BpIdx,
    active_sf: FrameIdx,
    terminal: Option<BpIdx>,
    finalized: bool,
}

impl BackpointerTable {
    pub fn new(n_words: usize) -> Self {
        let mut table = Self::default();
        table.reset(n_words);
        table
    }

    /// Empty the table for a new utterance.
    pub fn reset(&mut self, n_words: usize) {
        self.entries.clear();
        self.rc_scores.clear();
        self.frame_starts.clear();
        self.norm.clear();
        self.open.clear();
        self.open.resize(n_words, None);
        self.open_words.clear();
        self.retired = 0;
        self.pending_sf.clear();
        self.scanned = 0;
        self.active_sf = 0;
        self.terminal = None;
        self.finalized = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frames opened so far.
    pub fn n_frames(&self) -> usize {
        self.frame_starts.len()
    }

    pub fn entries(&self) -> &[BackpointerEntry] {
        &self.entries
    }

    pub fn get(&self, idx: BpIdx) -> &BackpointerEntry {
        &self.entries[idx]
    }

    /// Entries exiting in `frame`.
    pub fn frame_range(&self, frame: FrameIdx) -> Range<BpIdx> {
        let start = self.frame_starts.get(frame).copied().unwrap_or(self.entries.len());
        let end = self
            .frame_starts
            .get(frame + 1)
            .copied()
            .unwrap_or(self.entries.len());
        start..end
    }

    /// Right-context exit scores of an entry.
    pub fn rc_scores(&self, idx: BpIdx) -> &[Score] {
        let e = &self.entries[idx];
        &self.rc_scores[e.rc_start..e.rc_start + e.rc_len]
    }

    /// First frame of the word ending at `idx`.
    pub fn start_frame(&self, idx: BpIdx) -> FrameIdx {
        self.entries[idx]
            .history
            .map_or(0, |h| self.entries[h].frame + 1)
    }

    /// Score comparable across renormalizations.
    pub fn true_score(&self, idx: BpIdx) -> i64 {
        let e = &self.entries[idx];
        e.score as i64 + self.norm[e.frame]
    }

    pub fn retired(&self) -> BpIdx {
        self.retired
    }

    /// Every entry not yet retired, and every entry created later, starts at
    /// or after this frame.
    pub fn active_sf(&self) -> FrameIdx {
        self.active_sf
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Open the next frame. Returns the range of entries retired by
    /// `watermark`, which may now be forwarded.
    pub fn push_frame(&mut self, watermark: Watermark) -> Range<BpIdx> {
        debug_assert!(!self.finalized, "push_frame after finalize");
        let frame = self.frame_starts.len();
        self.frame_starts.push(self.entries.len());
        let carried = self.norm.last().copied().unwrap_or(0);
        self.norm.push(carried);
        for w in self.open_words.drain(..) {
            self.open[w] = None;
        }
        // Every entry is closed now; histories no longer change.
        for i in self.scanned..self.entries.len() {
            let sf = self.start_frame(i);
            while self.pending_sf.back().is_some_and(|&(_, s)| s >= sf) {
                self.pending_sf.pop_back();
            }
            self.pending_sf.push_back((i, sf));
        }
        self.scanned = self.entries.len();

        let (upto, bound) = match watermark {
            Watermark::UtteranceStart => (self.retired, 0),
            Watermark::Entry(b) => {
                debug_assert!(b < self.entries.len(), "watermark {b} past table end");
                (b.max(self.retired), self.entries[b].frame + 1)
            }
            Watermark::Empty => (self.entries.len(), frame),
        };
        let retired = self.retire_to(upto);
        while self.pending_sf.front().is_some_and(|&(i, _)| i < self.retired) {
            self.pending_sf.pop_front();
        }
        let pending = self.pending_sf.front().map(|&(_, sf)| sf);
        self.active_sf = self.active_sf.max(pending.map_or(bound, |sf| sf.min(bound)));
        retired
    }

    fn retire_to(&mut self, upto: BpIdx) -> Range<BpIdx> {
        let range = self.retired..upto.max(self.retired);
        self.retired = range.end;
        range
    }

    /// Record an exit of `word` from right context `rc` (of `n_rc`) in the
    /// current frame.
    pub fn enter(
        &mut self,
        dict: &dyn Dictionary,
        word: WordId,
        history: Option<BpIdx>,
        score: Score,
        rc: usize,
        n_rc: usize,
    ) -> BpIdx {
        debug_assert!(!self.finalized, "enter after finalize");
        debug_assert!(rc < n_rc, "right context {rc} of {n_rc}");
        let frame = self.frame_starts.len().saturating_sub(1);

        if let Some(idx) = self.open[word] {
            debug_assert_eq!(self.entries[idx].frame, frame, "stale open entry");
            if better_than(score, self.entries[idx].score) {
                if self.entries[idx].history != history {
                    let (real, prev_real) = self.real_words(dict, word, history);
                    let e = &mut self.entries[idx];
                    e.history = history;
                    e.real_word = real;
                    e.prev_real_word = prev_real;
                }
                self.entries[idx].score = score;
            }
            let start = self.entries[idx].rc_start;
            self.rc_scores[start + rc] = score;
            return idx;
        }

        let n_phones = dict.phone_count(word);
        let (real_word, prev_real_word) = self.real_words(dict, word, history);
        let rc_start = self.rc_scores.len();
        self.rc_scores.resize(rc_start + n_rc, WORST_SCORE);
        self.rc_scores[rc_start + rc] = score;

        let idx = self.entries.len();
        self.entries.push(BackpointerEntry {
            word,
            frame,
            score,
            history,
            real_word,
            prev_real_word,
            last_phone: dict.last_phone(word),
            second_last_phone: (n_phones > 1).then(|| dict.phone_at(word, n_phones - 2)),
            rc_start,
            rc_len: n_rc,
        });
        self.open[word] = Some(idx);
        self.open_words.push(word);
        idx
    }

    fn real_words(
        &self,
        dict: &dyn Dictionary,
        word: WordId,
        history: Option<BpIdx>,
    ) -> (WordId, Option<WordId>) {
        match history.map(|h| &self.entries[h]) {
            Some(h) if dict.is_filler(word) => (h.real_word, h.prev_real_word),
            Some(h) => (dict.base_word(word), Some(h.real_word)),
            None => (dict.base_word(word), None),
        }
    }

    /// Note that live scores of the current frame were reduced by `norm`.
    pub fn record_normalization(&mut self, norm: Score) {
        if let Some(total) = self.norm.last_mut() {
            *total += norm as i64;
        }
    }

    /// Close the table: pick the terminal entry and retire everything.
    pub fn finalize(&mut self, finish_word: WordId) -> Range<BpIdx> {
        let last = (0..self.n_frames())
            .rev()
            .map(|f| self.frame_range(f))
            .find(|r| !r.is_empty());
        self.terminal = last.and_then(|r| {
            let finish = r.clone().find(|&i| self.entries[i].word == finish_word);
            finish.or_else(|| {
                r.fold(None, |best: Option<BpIdx>, i| match best {
                    Some(b) if !better_than(self.entries[i].score, self.entries[b].score) => best,
                    _ => Some(i),
                })
            })
        });
        self.finalized = true;
        self.open_words.clear();
        self.active_sf = self.active_sf.max(self.n_frames());
        self.retire_to(self.entries.len())
    }

    pub fn terminal(&self) -> Option<BpIdx> {
        self.terminal
    }

    /// Entries on the path ending at `terminal`, first word first.
    pub fn path(&self, terminal: BpIdx) -> Vec<BpIdx> {
        let mut path: Vec<BpIdx> =
            std::iter::successors(Some(terminal), |&i| self.entries[i].history).collect();
        path.reverse();
        path
    }

    /// Non-filler words on the path ending at `terminal`.
    pub fn extract_hypothesis(&self, dict: &dyn Dictionary, terminal: BpIdx) -> Vec<WordId> {
        self.path(terminal)
            .into_iter()
            .map(|i| self.entries[i].word)
            .filter(|&w| !dict.is_filler(w))
            .collect()
    }

    /// Every exit that lies on some path reaching the last frame with exits,
    /// in table order.
    pub fn extract_lattice(&self) -> Vec<LatticeEdge> {
        let mut live = vec![false; self.entries.len()];
        if let Some(last) = (0..self.n_frames())
            .rev()
            .map(|f| self.frame_range(f))
            .find(|r| !r.is_empty())
        {
            for end in last {
                let mut cur = Some(end);
                while let Some(i) = cur.filter(|&i| !live[i]) {
                    live[i] = true;
                    cur = self.entries[i].history;
                }
            }
        }
        live.iter()
            .enumerate()
            .filter(|&(_, &on)| on)
            .map(|(i, _)| LatticeEdge {
                entry: i,
                history: self.entries[i].history,
                word: self.entries[i].word,
                start_frame: self.start_frame(i),
                end_frame: self.entries[i].frame,
                path_score: self.true_score(i),
            })
            .collect()
    }
}
