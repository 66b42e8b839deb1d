//! Left-to-right phone HMMs and their Viterbi step.
//!
//! ## Score convention
//!
//! ```text
//! state[j]  = best path score entering state j at the frame stored in `frame`
//! eval()    : s[j] = state[j] + senone(j)            (emission at this frame)
//!             out  = max_i s[i] + tp[i][N]            (non-emitting exit)
//!             state[j] = max_{i<=j} s[i] + tp[i][j]   (entering j next frame)
//! ```
//!
//! Histories travel with the winning predecessor. Multiplexed roots also carry
//! a per-state senone sequence, because the left context of a word-initial
//! phone is only known when the word is entered.

use crate::error::{Result, SearchError};
use crate::logmath::{add, better_than, is_reachable, LogMath, Score, WORST_SCORE};
use crate::model::{FrameIdx, SenoneId, SsId, TmatId};
use crate::search::bptbl::BpIdx;

/// Upper bound on emitting states per HMM.
pub const MAX_HMM_STATES: usize = 5;

/// Log-domain transition probabilities `tp[from][to]`, `to == n` being exit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    n_emit: usize,
    tp: Vec<Score>,
}

impl TransitionMatrix {
    /// Build from log scores, one row of `n_emit + 1` entries per emitting state.
    pub fn from_scores(rows: Vec<Vec<Score>>) -> Result<Self> {
        let n_emit = rows.len();
        if n_emit == 0 || n_emit > MAX_HMM_STATES {
            return Err(SearchError::InvalidHmm(format!(
                "transition matrix has {n_emit} emitting states (1..={MAX_HMM_STATES} supported)"
            )));
        }
        let mut tp = Vec::with_capacity(n_emit * (n_emit + 1));
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n_emit + 1 {
                return Err(SearchError::InvalidHmm(format!(
                    "row {i} has {} columns, expected {}",
                    row.len(),
                    n_emit + 1
                )));
            }
            for (j, &s) in row.iter().enumerate() {
                if j < i && is_reachable(s) {
                    return Err(SearchError::InvalidHmm(format!(
                        "backward transition {i}->{j} in left-to-right topology"
                    )));
                }
            }
            tp.extend(row.into_iter().map(|s| s.max(WORST_SCORE)));
        }
        Ok(Self { n_emit, tp })
    }

    /// Build from linear probabilities.
    pub fn from_probs(lmath: &LogMath, rows: &[Vec<f64>]) -> Result<Self> {
        Self::from_scores(
            rows.iter()
                .map(|r| r.iter().map(|&p| lmath.log(p)).collect())
                .collect(),
        )
    }

    /// Standard Bakis topology: self loop `p_loop`, advance `1 - p_loop`.
    pub fn left_to_right(lmath: &LogMath, n_emit: usize, p_loop: f64) -> Result<Self> {
        let rows: Vec<Vec<f64>> = (0..n_emit)
            .map(|i| {
                let mut row = vec![0.0; n_emit + 1];
                row[i] = p_loop;
                row[i + 1] = 1.0 - p_loop;
                row
            })
            .collect();
        Self::from_probs(lmath, &rows)
    }

    pub fn n_emit(&self) -> usize {
        self.n_emit
    }

    #[inline]
    pub fn get(&self, from: usize, to: usize) -> Score {
        self.tp[from * (self.n_emit + 1) + to]
    }
}

/// HMM topology shared by every node: transition matrices and senone sequences.
#[derive(Debug, Clone)]
pub struct HmmDefinition {
    n_emit_state: usize,
    n_senones: usize,
    tmats: Vec<TransitionMatrix>,
    sseqs: Vec<Vec<SenoneId>>,
}

impl HmmDefinition {
    pub fn new(
        n_senones: usize,
        tmats: Vec<TransitionMatrix>,
        sseqs: Vec<Vec<SenoneId>>,
    ) -> Result<Self> {
        let n_emit_state = tmats
            .first()
            .map(TransitionMatrix::n_emit)
            .ok_or_else(|| SearchError::InvalidHmm("no transition matrices".into()))?;
        if let Some(bad) = tmats.iter().position(|t| t.n_emit() != n_emit_state) {
            return Err(SearchError::InvalidHmm(format!(
                "transition matrix {bad} disagrees on emitting state count"
            )));
        }
        for (i, seq) in sseqs.iter().enumerate() {
            if seq.len() != n_emit_state {
                return Err(SearchError::InvalidHmm(format!(
                    "senone sequence {i} has {} states, expected {n_emit_state}",
                    seq.len()
                )));
            }
            if let Some(&s) = seq.iter().find(|&&s| s >= n_senones) {
                return Err(SearchError::InvalidHmm(format!(
                    "senone sequence {i} references senone {s} of {n_senones}"
                )));
            }
        }
        Ok(Self {
            n_emit_state,
            n_senones,
            tmats,
            sseqs,
        })
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_senones(&self) -> usize {
        self.n_senones
    }

    pub fn n_tmats(&self) -> usize {
        self.tmats.len()
    }

    pub fn n_sseqs(&self) -> usize {
        self.sseqs.len()
    }

    #[inline]
    pub fn senone(&self, ssid: SsId, state: usize) -> SenoneId {
        self.sseqs[ssid][state]
    }

    #[inline]
    pub fn tmat(&self, tmat: TmatId) -> &TransitionMatrix {
        &self.tmats[tmat]
    }
}

/// Viterbi state of one phone instance.
#[derive(Debug, Clone)]
pub struct Hmm {
    score: [Score; MAX_HMM_STATES],
    history: [Option<BpIdx>; MAX_HMM_STATES],
    /// Per-state sequence; only index 0 is used unless `mpx`.
    ssid: [SsId; MAX_HMM_STATES],
    out_score: Score,
    out_history: Option<BpIdx>,
    best_score: Score,
    frame: Option<FrameIdx>,
    tmat: TmatId,
    mpx: bool,
}

impl Hmm {
    pub fn new(mpx: bool, ssid: SsId, tmat: TmatId) -> Self {
        Self {
            score: [WORST_SCORE; MAX_HMM_STATES],
            history: [None; MAX_HMM_STATES],
            ssid: [ssid; MAX_HMM_STATES],
            out_score: WORST_SCORE,
            out_history: None,
            best_score: WORST_SCORE,
            frame: None,
            tmat,
            mpx,
        }
    }

    /// Last frame this HMM was entered or advanced to.
    pub fn frame(&self) -> Option<FrameIdx> {
        self.frame
    }

    pub fn is_at(&self, frame: FrameIdx) -> bool {
        self.frame == Some(frame)
    }

    /// Not touched at or after `frame`.
    pub fn is_before(&self, frame: FrameIdx) -> bool {
        self.frame.map_or(true, |f| f < frame)
    }

    pub fn set_frame(&mut self, frame: FrameIdx) {
        debug_assert!(self.frame.map_or(true, |f| f <= frame));
        self.frame = Some(frame);
    }

    pub fn in_score(&self) -> Score {
        self.score[0]
    }

    pub fn out_score(&self) -> Score {
        self.out_score
    }

    pub fn out_history(&self) -> Option<BpIdx> {
        self.out_history
    }

    pub fn best_score(&self) -> Score {
        self.best_score
    }

    pub fn state_score(&self, state: usize) -> Score {
        self.score[state]
    }

    pub fn is_mpx(&self) -> bool {
        self.mpx
    }

    /// Sequence currently used by `state`.
    pub fn ssid(&self, state: usize) -> SsId {
        if self.mpx {
            self.ssid[state]
        } else {
            self.ssid[0]
        }
    }

    /// Select the left-context variant carried into state 0.
    pub fn set_entry_ssid(&mut self, ssid: SsId) {
        self.ssid[0] = ssid;
    }

    /// Start a path in state 0 for `frame`.
    pub fn enter(&mut self, score: Score, history: Option<BpIdx>, frame: FrameIdx) {
        self.score[0] = score;
        self.history[0] = history;
        self.set_frame(frame);
    }

    /// Reset all scores. The frame stamp is kept so it never moves backwards.
    pub fn clear(&mut self) {
        self.score = [WORST_SCORE; MAX_HMM_STATES];
        self.history = [None; MAX_HMM_STATES];
        self.out_score = WORST_SCORE;
        self.out_history = None;
        self.best_score = WORST_SCORE;
    }

    /// Mark every senone this HMM will read into `active`.
    pub fn activate(&self, def: &HmmDefinition, active: &mut [bool]) {
        for j in 0..def.n_emit_state() {
            active[def.senone(self.ssid(j), j)] = true;
        }
    }

    /// Smallest history referenced by a reachable state, if any.
    ///
    /// The outer `Option` is `None` when nothing is reachable; the inner one
    /// is `None` for paths that start at the utterance start.
    pub fn oldest_history(&self, n_emit: usize) -> Option<Option<BpIdx>> {
        let states = (0..n_emit)
            .filter(|&j| is_reachable(self.score[j]))
            .map(|j| self.history[j]);
        let out = is_reachable(self.out_score).then_some(self.out_history);
        states.chain(out).min()
    }

    /// One Viterbi step using `senscr`. Returns the new best score.
    pub fn eval(&mut self, def: &HmmDefinition, senscr: &[Score]) -> Score {
        let n = def.n_emit_state();
        let tp = def.tmat(self.tmat);

        let mut s = [WORST_SCORE; MAX_HMM_STATES];
        for (j, slot) in s.iter_mut().enumerate().take(n) {
            if is_reachable(self.score[j]) {
                *slot = add(self.score[j], senscr[def.senone(self.ssid(j), j)]);
            }
        }

        let mut out = WORST_SCORE;
        let mut out_hist = None;
        for i in 0..n {
            let t = tp.get(i, n);
            if is_reachable(s[i]) && is_reachable(t) {
                let cand = add(s[i], t);
                if better_than(cand, out) {
                    out = cand;
                    out_hist = self.history[i];
                }
            }
        }

        let mut score = [WORST_SCORE; MAX_HMM_STATES];
        let mut history = [None; MAX_HMM_STATES];
        let mut ssid = self.ssid;
        let mut best = out;
        for j in 0..n {
            for i in 0..=j {
                let t = tp.get(i, j);
                if is_reachable(s[i]) && is_reachable(t) {
                    let cand = add(s[i], t);
                    if better_than(cand, score[j]) {
                        score[j] = cand;
                        history[j] = self.history[i];
                        ssid[j] = self.ssid[i];
                    }
                }
            }
            if better_than(score[j], best) {
                best = score[j];
            }
        }

        self.score = score;
        self.history = history;
        if self.mpx {
            self.ssid = ssid;
        }
        self.out_score = out;
        self.out_history = out_hist;
        self.best_score = best;
        best
    }

    /// Subtract `norm` from every reachable score.
    pub fn normalize(&mut self, norm: Score) {
        for s in self.score.iter_mut().filter(|s| is_reachable(**s)) {
            *s -= norm;
        }
        if is_reachable(self.out_score) {
            self.out_score -= norm;
        }
        if is_reachable(self.best_score) {
            self.best_score -= norm;
        }
    }
}
