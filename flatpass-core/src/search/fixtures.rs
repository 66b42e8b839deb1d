//! Small models and scripted acoustics shared by the search unit tests.

use std::sync::Arc;
use std::time::Duration;

use super::{FlatSearch, FrameStatus, SearchModels, UtteranceOutcome};
use crate::buffering::{ArcBuffer, WaitStatus, WordArc};
use crate::engine::SearchConfig;
use crate::hmm::{HmmDefinition, TransitionMatrix};
use crate::logmath::{Score, WORST_SCORE};
use crate::model::stub::{ContextIndependent, TableDictionary, TableLanguageModel};
use crate::model::{AcousticModel, Dictionary, FrameIdx};

/// Phones `SIL a b`, one senone each, single-state HMMs with a -10 loop and
/// a -10 exit. Words `A = a`, `B = b`, `C = a b`; `C` has no unigram.
pub(crate) fn scenario_models() -> SearchModels {
    let mut dict = TableDictionary::new(0);
    let a = dict.add_word("A", &[1]).expect("A");
    let b = dict.add_word("B", &[2]).expect("B");
    dict.add_word("C", &[1, 2]).expect("C");
    let lm = TableLanguageModel::new()
        .unigram(a, -100)
        .unigram(b, -100)
        .unigram(dict.finish_word(), -100);
    let tmat = TransitionMatrix::from_scores(vec![vec![-10, -10]]).expect("tmat");
    let hmm = HmmDefinition::new(3, vec![tmat], vec![vec![0], vec![1], vec![2]]).expect("hmm");
    SearchModels {
        dictionary: Arc::new(dict),
        context: Arc::new(ContextIndependent::new(3, 0)),
        hmm: Arc::new(hmm),
        lm: Arc::new(lm),
    }
}

/// `scenario_models` with a unigram for the two-phone word `C`.
pub(crate) fn two_phone_models() -> SearchModels {
    let mut models = scenario_models();
    let dict = &*models.dictionary;
    let c = dict.word_id("C").expect("C");
    models.lm = Arc::new(
        TableLanguageModel::new()
            .unigram(dict.word_id("A").expect("A"), -100)
            .unigram(dict.word_id("B").expect("B"), -100)
            .unigram(c, -100)
            .unigram(dict.finish_word(), -100),
    );
    models
}

pub(crate) fn config() -> SearchConfig {
    SearchConfig {
        word_insertion_prob: 1.0,
        silence_prob: 1e-3,
        ..SearchConfig::default()
    }
}

pub(crate) fn scenario_search() -> FlatSearch {
    FlatSearch::new(&config(), scenario_models()).expect("scenario search")
}

/// Senone scores and upstream arcs for one utterance.
pub(crate) struct Script {
    pub frames: Vec<Arc<[Score]>>,
    pub arcs: Vec<WordArc>,
}

impl Script {
    /// `a` is certain in frames 0-4 and `b` in frames 5-9; upstream proposes
    /// `A` at 0 and `B` at 5.
    pub fn scenario_a() -> Self {
        let frames: Vec<Arc<[Score]>> = (0..10)
            .map(|f| {
                let hot = if f < 5 { 1 } else { 2 };
                (0..3).map(|s| if s == hot { 0 } else { -5000 }).collect()
            })
            .collect();
        Self {
            frames,
            arcs: vec![WordArc::hint(3, 0, 4), WordArc::hint(4, 5, 9)],
        }
    }

    /// The acoustics of `scenario_a`, with upstream proposing only `C`.
    pub fn two_phone_word() -> Self {
        Self {
            arcs: vec![WordArc::hint(5, 0, 9)],
            ..Self::scenario_a()
        }
    }

    /// Every senone unreachable in every frame.
    pub fn degenerate(n_frames: usize) -> Self {
        Self {
            frames: (0..n_frames)
                .map(|_| Arc::<[Score]>::from(vec![WORST_SCORE; 3]))
                .collect(),
            arcs: vec![WordArc::hint(3, 0, 4)],
        }
    }

    pub fn acoustic(&self) -> ScriptedAcoustic {
        ScriptedAcoustic {
            frames: self.frames.clone(),
            released: 0,
        }
    }
}

/// Acoustic model whose frames are all available up front.
pub(crate) struct ScriptedAcoustic {
    frames: Vec<Arc<[Score]>>,
    released: usize,
}

impl AcousticModel for ScriptedAcoustic {
    fn start_utterance(&mut self, _timeout: Option<Duration>) -> WaitStatus {
        WaitStatus::Ready
    }

    fn wait_for_frame(&mut self, frame: FrameIdx, _timeout: Option<Duration>) -> WaitStatus {
        if frame < self.frames.len() {
            WaitStatus::Ready
        } else {
            WaitStatus::EndOfUtterance
        }
    }

    fn score_frame(&mut self, frame: FrameIdx) -> Option<Arc<[Score]>> {
        (frame >= self.released)
            .then(|| self.frames.get(frame).cloned())
            .flatten()
    }

    fn is_end_of_utterance(&self) -> bool {
        true
    }

    fn release_frame(&mut self, frame: FrameIdx) {
        self.released = self.released.max(frame + 1);
    }

    fn end_utterance(&mut self) {
        self.released = 0;
    }
}

pub(crate) struct Run {
    pub outcome: UtteranceOutcome,
    pub failed_at: Option<FrameIdx>,
    /// Stored (normalized) entry scores.
    pub bptbl_scores: Vec<Score>,
    pub forwarded: Vec<WordArc>,
}

/// Decode `script` frame by frame without the pipeline driver, offering the
/// arcs inside the lookahead window at each frame.
pub(crate) fn decode(search: &FlatSearch, script: &Script) -> Run {
    let output = ArcBuffer::new("fixture-out");
    let mut acoustic = script.acoustic();
    let mut utt = search.start_utterance(&output);
    let mut failed_at = None;

    for frame in 0..script.frames.len() {
        let from = frame.saturating_sub(search.window());
        let to = frame + search.window();
        let window: Vec<&WordArc> = script
            .arcs
            .iter()
            .filter(|a| (from..to).contains(&a.start_frame))
            .collect();
        search.expand_arcs(&mut utt, window);
        let status = search
            .search_frame(&mut utt, &mut acoustic, &output)
            .expect("search frame");
        if status == FrameStatus::Failed {
            failed_at = Some(frame);
            break;
        }
    }

    let outcome = search.finish_utterance(&mut utt, &mut acoustic, &output);
    let bptbl_scores = utt.bptbl().entries().iter().map(|e| e.score).collect();
    let forwarded = output.lock().iter().copied().collect();
    Run {
        outcome,
        failed_at,
        bptbl_scores,
        forwarded,
    }
}
