//! Flat-lexicon time-synchronous beam search.
//!
//! ## Per-frame order
//!
//! ```text
//! compute_active   senones of live nodes + oldest referenced backpointer
//! score_frame      acoustic model → senone scores
//! push_frame       open the frame, forward retired exits downstream
//! renormalize      only when best + 2·beam would underflow
//! eval_frame       one Viterbi step on every live node
//! prune            beam pruning, phone transitions, word exits
//! word_transition  exits × candidate words, LM rescoring
//! build_next       touched words → next active list
//! ```
//!
//! [`FlatSearch`] holds the models and tuning, and is shared. All mutable
//! per-utterance state lives in an [`Utterance`] owned by the driver.

pub mod bptbl;

mod active;
mod evaluate;
mod network;
mod transition;

#[cfg(test)]
pub(crate) mod fixtures;

use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffering::{ArcBuffer, WordArc};
use crate::engine::SearchConfig;
use crate::error::{Result, SearchError};
use crate::hmm::HmmDefinition;
use crate::logmath::{is_reachable, LogMath, Score, WORST_SCORE};
use crate::model::{
    AcousticModel, Dictionary, FrameIdx, LanguageModel, PhoneContext, VocabMap, WordId,
};

use active::{ActiveLists, Generation};
use bptbl::{BackpointerTable, BpIdx, LatticeEdge};
use network::WordNetwork;

/// Collaborators shared by every utterance.
#[derive(Clone)]
pub struct SearchModels {
    pub dictionary: Arc<dyn Dictionary>,
    pub context: Arc<dyn PhoneContext>,
    pub hmm: Arc<HmmDefinition>,
    pub lm: Arc<dyn LanguageModel>,
}

/// Beam widths and penalties in the integer log domain.
///
/// Beams are negative: a hypothesis survives when it is better than
/// `best + beam`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beams {
    pub beam: Score,
    pub word_beam: Score,
    pub lm_weight: f64,
    pub phone_penalty: Score,
    pub word_penalty: Score,
    pub silence_penalty: Score,
    pub filler_penalty: Score,
}

impl Beams {
    pub fn from_config(config: &SearchConfig, lmath: &LogMath) -> Self {
        Self {
            beam: lmath.log(config.beam),
            word_beam: lmath.log(config.word_beam),
            lm_weight: config.lm_weight,
            phone_penalty: lmath.log(config.phone_insertion_prob),
            word_penalty: lmath.log(config.word_insertion_prob),
            silence_penalty: lmath.log(config.silence_prob),
            filler_penalty: lmath.log(config.filler_prob),
        }
    }
}

/// Per-utterance counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceStats {
    pub frames: usize,
    pub channels_evaluated: usize,
    pub words_searched: usize,
    pub word_transitions: usize,
    pub senones_active: usize,
    pub renormalizations: usize,
    pub entries: usize,
    pub vocabulary: usize,
}

/// Outcome of one searched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Searched,
    /// The best score became unreachable; the utterance should be finished.
    Failed,
}

/// One word of the best path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub word: WordId,
    pub text: String,
    pub start_frame: FrameIdx,
    pub end_frame: FrameIdx,
    pub acoustic_score: Score,
    pub lm_score: Score,
}

/// What a finished utterance produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceOutcome {
    /// Non-filler words of the best path.
    pub words: Vec<String>,
    pub segments: Vec<Segment>,
    pub path_score: Option<i64>,
    pub terminal: Option<BpIdx>,
    pub stats: UtteranceStats,
}

/// Mutable state of one utterance.
#[derive(Debug)]
pub struct Utterance {
    net: WordNetwork,
    active: ActiveLists,
    bptbl: BackpointerTable,
    expand_marks: Vec<bool>,
    expand: Vec<WordId>,
    best_score: Score,
    frame: FrameIdx,
    stats: UtteranceStats,
}

impl Utterance {
    /// Next frame to search.
    pub fn frame(&self) -> FrameIdx {
        self.frame
    }

    /// Best score of the last searched frame.
    pub fn best_score(&self) -> Score {
        self.best_score
    }

    pub fn bptbl(&self) -> &BackpointerTable {
        &self.bptbl
    }

    pub fn stats(&self) -> &UtteranceStats {
        &self.stats
    }

    /// Words with a chain in this utterance, in build order.
    pub fn vocabulary(&self) -> &[WordId] {
        self.net.vocab()
    }

    /// All exits lying on a path to the last frame with exits.
    pub fn lattice(&self) -> Vec<LatticeEdge> {
        self.bptbl.extract_lattice()
    }
}

pub struct FlatSearch {
    models: SearchModels,
    beams: Beams,
    window: usize,
    vocab_map: Option<VocabMap>,
    fillers: Vec<WordId>,
    renorm_interval: Option<usize>,
}

impl FlatSearch {
    /// Validate the models against each other and build the search.
    ///
    /// # Errors
    /// Any configuration, pronunciation, HMM or vocabulary map problem, and an
    /// LM that cannot score the sentence-end word.
    pub fn new(config: &SearchConfig, models: SearchModels) -> Result<Self> {
        config.validate()?;
        let lmath = LogMath::new(config.log_base);
        let beams = Beams::from_config(config, &lmath);
        let dict = &*models.dictionary;

        validate_models(dict, &*models.context, &models.hmm)?;

        let finish = dict.finish_word();
        if !models.lm.is_known_word(dict.base_word(finish)) {
            return Err(SearchError::MissingFinishWord {
                word: dict.word_str(finish).to_string(),
            });
        }

        let vocab_map = config
            .vocab_map
            .as_deref()
            .map(|path| VocabMap::load(path, dict))
            .transpose()?;
        let fillers = dict.filler_words();

        info!(
            words = dict.word_count(),
            fillers = fillers.len(),
            beam = beams.beam,
            word_beam = beams.word_beam,
            lm_weight = beams.lm_weight,
            window = config.lookahead_window,
            "flat search ready"
        );

        Ok(Self {
            models,
            beams,
            window: config.lookahead_window,
            vocab_map,
            fillers,
            renorm_interval: None,
        })
    }

    /// Renormalize every `interval` frames regardless of the score range.
    #[cfg(test)]
    pub(crate) fn with_renormalization_interval(mut self, interval: usize) -> Self {
        self.renorm_interval = Some(interval);
        self
    }

    pub fn beams(&self) -> &Beams {
        &self.beams
    }

    /// Arc window half-width in frames.
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn dictionary(&self) -> &dyn Dictionary {
        &*self.models.dictionary
    }

    // ── Utterance lifecycle ──────────────────────────────────────────────────

    /// Reset per-utterance state, build the special word chains and seed the
    /// start word.
    pub fn start_utterance(&self, output: &ArcBuffer) -> Utterance {
        let dict = &*self.models.dictionary;
        let ctx = &*self.models.context;
        let n_words = dict.word_count();

        output.start_utterance();

        let mut utt = Utterance {
            net: WordNetwork::new(n_words),
            active: ActiveLists::new(n_words, self.models.hmm.n_senones()),
            bptbl: BackpointerTable::new(n_words),
            expand_marks: vec![false; n_words],
            expand: Vec::new(),
            best_score: 0,
            frame: 0,
            stats: UtteranceStats::default(),
        };

        let start = dict.start_word();
        for w in [start, dict.finish_word(), dict.silence_word()]
            .into_iter()
            .chain(self.fillers.iter().copied())
        {
            utt.net.build(w, dict, ctx);
        }
        if let Some(chain) = utt.net.chain(start).copied() {
            utt.net.node_mut(chain.root).hmm.enter(0, None, 0);
            utt.active.push(Generation::Current, start);
        }
        debug!(vocabulary = utt.net.vocab().len(), "utterance started");
        utt
    }

    /// Replace the candidate set with the words of `arcs`, unmapping through
    /// the vocabulary map and building chains on demand.
    pub fn expand_arcs<'a>(&self, utt: &mut Utterance, arcs: impl IntoIterator<Item = &'a WordArc>) {
        utt.expand_marks.iter_mut().for_each(|m| *m = false);
        for arc in arcs {
            match self.vocab_map.as_ref().and_then(|m| m.unmap(arc.word)) {
                Some(words) => {
                    for &w in words {
                        self.add_expand_word(utt, w);
                    }
                }
                None => self.add_expand_word(utt, arc.word),
            }
        }
    }

    fn add_expand_word(&self, utt: &mut Utterance, word: WordId) {
        let dict = &*self.models.dictionary;
        if word >= dict.word_count() {
            warn!(word, "arc for a word outside the dictionary ignored");
            return;
        }
        if utt.expand_marks[word] || word == dict.start_word() {
            return;
        }
        if !self.models.lm.is_known_word(dict.base_word(word)) {
            return;
        }
        utt.expand_marks[word] = true;
        utt.net.build(word, dict, &*self.models.context);
    }

    /// Search frame `utt.frame()`, which the acoustic model must have ready.
    pub fn search_frame(
        &self,
        utt: &mut Utterance,
        acoustic: &mut dyn AcousticModel,
        output: &ArcBuffer,
    ) -> Result<FrameStatus> {
        let frame = utt.frame;
        let def = &*self.models.hmm;

        let watermark = utt.active.compute_active(frame, &utt.net, def);
        acoustic.activate_senones(utt.active.senones());
        let senscr = acoustic
            .score_frame(frame)
            .ok_or(SearchError::MissingFrame(frame))?;
        if senscr.len() < def.n_senones() {
            return Err(SearchError::InvalidHmm(format!(
                "frame {frame} has {} senone scores, expected {}",
                senscr.len(),
                def.n_senones()
            )));
        }
        utt.stats.senones_active += utt.active.n_senones_active();

        let retired = utt.bptbl.push_frame(watermark);
        self.forward(utt, retired, output);

        if !is_reachable(utt.best_score) {
            warn!(frame, "best score unreachable, stopping search");
            return Ok(FrameStatus::Failed);
        }
        if self.needs_renormalization(utt.best_score, frame) {
            self.renormalize(utt, frame);
        }

        self.eval_frame(utt, frame, &senscr);
        self.prune(utt, frame);
        self.word_transition(utt, frame);

        utt.active.build_next(&utt.net);
        utt.active.swap();
        acoustic.release_frame(frame);
        utt.frame += 1;
        utt.stats.frames += 1;
        Ok(FrameStatus::Searched)
    }

    fn needs_renormalization(&self, best: Score, frame: FrameIdx) -> bool {
        let forced = self
            .renorm_interval
            .is_some_and(|n| frame > 0 && frame % n == 0);
        forced || (best as i64) + 2 * (self.beams.beam as i64) < WORST_SCORE as i64
    }

    /// Finalize the table, flush the output and release the utterance's
    /// chains.
    pub fn finish_utterance(
        &self,
        utt: &mut Utterance,
        acoustic: &mut dyn AcousticModel,
        output: &ArcBuffer,
    ) -> UtteranceOutcome {
        let dict = &*self.models.dictionary;
        let retired = utt.bptbl.finalize(dict.finish_word());
        self.forward(utt, retired, output);
        output.end_utterance(false);
        acoustic.end_utterance();

        utt.stats.entries = utt.bptbl.len();
        utt.stats.vocabulary = utt.net.vocab().len();
        let terminal = utt.bptbl.terminal();
        let segments = terminal.map_or_else(Vec::new, |t| self.segments(&utt.bptbl, t));
        let words = terminal.map_or_else(Vec::new, |t| {
            utt.bptbl
                .extract_hypothesis(dict, t)
                .into_iter()
                .map(|w| dict.word_str(dict.base_word(w)).to_string())
                .collect()
        });
        let path_score = terminal.map(|t| utt.bptbl.true_score(t));

        let s = &utt.stats;
        let per_frame = |n: usize| n / s.frames.max(1);
        info!(
            frames = s.frames,
            words_recognized = s.entries,
            senones_evaluated = s.senones_active,
            senones_per_frame = per_frame(s.senones_active),
            channels_searched = s.channels_evaluated,
            channels_per_frame = per_frame(s.channels_evaluated),
            words_searched = s.words_searched,
            word_transitions = s.word_transitions,
            renormalizations = s.renormalizations,
            vocabulary = s.vocabulary,
            "utterance finished"
        );

        utt.net.destroy_all();
        UtteranceOutcome {
            words,
            segments,
            path_score,
            terminal,
            stats: utt.stats.clone(),
        }
    }

    // ── Output ───────────────────────────────────────────────────────────────

    /// Send retired entries downstream, stamped with the completeness
    /// frontier.
    fn forward(&self, utt: &Utterance, retired: Range<BpIdx>, output: &ArcBuffer) {
        let arcs: Vec<WordArc> = retired.map(|i| self.output_arc(&utt.bptbl, i)).collect();
        output.push(arcs, utt.bptbl.active_sf());
    }

    fn output_arc(&self, bptbl: &BackpointerTable, idx: BpIdx) -> WordArc {
        let e = bptbl.get(idx);
        let (acoustic_score, lm_score) = self.exit_scores(bptbl, idx);
        WordArc {
            word: e.word,
            start_frame: bptbl.start_frame(idx),
            end_frame: e.frame,
            acoustic_score,
            lm_score,
            entry: Some(idx),
            history: e.history,
        }
    }

    /// Split the score of one exit into acoustic and language parts.
    fn exit_scores(&self, bptbl: &BackpointerTable, idx: BpIdx) -> (Score, Score) {
        let e = bptbl.get(idx);
        let Some(h) = e.history else {
            return (clamp_score(bptbl.true_score(idx)), 0);
        };
        let lm = self.transition_lm_score(e.word, bptbl.get(h));
        let delta = bptbl.true_score(idx)
            - bptbl.true_score(h)
            - lm as i64
            - self.beams.word_penalty as i64;
        (clamp_score(delta), lm)
    }

    /// The language score a transition into `word` after `prev` was charged.
    fn transition_lm_score(&self, word: WordId, prev: &bptbl::BackpointerEntry) -> Score {
        let dict = &*self.models.dictionary;
        if word == dict.silence_word() {
            self.beams.silence_penalty
        } else if self.fillers.contains(&word) {
            self.beams.filler_penalty
        } else {
            self.lm_score(dict.base_word(word), prev.real_word, prev.prev_real_word)
        }
    }

    /// Weighted trigram score.
    fn lm_score(&self, word: WordId, prev: WordId, prev_prev: Option<WordId>) -> Score {
        let (score, _n_used) = self.models.lm.trigram_score(word, prev, prev_prev);
        if !is_reachable(score) {
            return WORST_SCORE;
        }
        clamp_score((score as f64 * self.beams.lm_weight).round() as i64)
    }

    /// The best path ending at `terminal`, with per-word score breakdown.
    pub fn segments(&self, bptbl: &BackpointerTable, terminal: BpIdx) -> Vec<Segment> {
        let dict = &*self.models.dictionary;
        bptbl
            .path(terminal)
            .into_iter()
            .map(|i| {
                let e = bptbl.get(i);
                let (acoustic_score, lm_score) = self.exit_scores(bptbl, i);
                Segment {
                    word: e.word,
                    text: dict.word_str(e.word).to_string(),
                    start_frame: bptbl.start_frame(i),
                    end_frame: e.frame,
                    acoustic_score,
                    lm_score,
                }
            })
            .collect()
    }
}

fn clamp_score(s: i64) -> Score {
    s.clamp(WORST_SCORE as i64, Score::MAX as i64) as Score
}

fn validate_models(
    dict: &dyn Dictionary,
    ctx: &dyn PhoneContext,
    def: &HmmDefinition,
) -> Result<()> {
    let n_phones = ctx.phone_count();
    for w in 0..dict.word_count() {
        let n = dict.phone_count(w);
        if n == 0 {
            return Err(SearchError::MalformedPronunciation {
                word: dict.word_str(w).to_string(),
                reason: "empty pronunciation".into(),
            });
        }
        if let Some(p) = (0..n).map(|i| dict.phone_at(w, i)).find(|&p| p >= n_phones) {
            return Err(SearchError::MalformedPronunciation {
                word: dict.word_str(w).to_string(),
                reason: format!("phone {p} outside phone set of {n_phones}"),
            });
        }
    }
    for p in 0..n_phones {
        if ctx.ci_ssid(p) >= def.n_sseqs() || ctx.tmat(p) >= def.n_tmats() {
            return Err(SearchError::InvalidHmm(format!(
                "phone {p} maps outside the HMM definition"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::fixtures::{self, Script};
    use super::*;
    use crate::logmath::{add, better_than};

    #[test]
    fn missing_finish_word_in_lm_is_fatal() {
        let mut models = fixtures::scenario_models();
        models.lm = Arc::new(crate::model::stub::TableLanguageModel::new().unigram(3, -1));
        let err = FlatSearch::new(&fixtures::config(), models).err();
        assert!(matches!(err, Some(SearchError::MissingFinishWord { .. })));
    }

    #[test]
    fn out_of_range_phone_is_fatal() {
        let mut dict = crate::model::stub::TableDictionary::new(0);
        dict.add_word("bad", &[42]).expect("add");
        let mut models = fixtures::scenario_models();
        models.dictionary = Arc::new(dict);
        let err = FlatSearch::new(&fixtures::config(), models).err();
        assert!(matches!(err, Some(SearchError::MalformedPronunciation { .. })));
    }

    #[test]
    fn unreadable_vocab_map_is_fatal() {
        let config = SearchConfig {
            vocab_map: Some("/nonexistent/flatpass.vmap".into()),
            ..fixtures::config()
        };
        let err = FlatSearch::new(&config, fixtures::scenario_models()).err();
        assert!(matches!(err, Some(SearchError::VocabMapIo { .. })));
    }

    #[test]
    fn candidates_skip_start_word_and_words_unknown_to_the_lm() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        let dict = search.dictionary();
        let start = dict.start_word();
        let stray = dict.word_id("C").expect("C");
        let a = dict.word_id("A").expect("A");
        let arcs = [
            WordArc::hint(start, 0, 2),
            WordArc::hint(stray, 0, 2),
            WordArc::hint(a, 0, 2),
        ];
        search.expand_arcs(&mut utt, &arcs);
        assert!(utt.net.is_built(a));
        assert!(!utt.net.is_built(stray), "C has no unigram");
        assert!(!utt.expand_marks[start]);
    }

    #[test]
    fn scenario_a_decodes_two_words_in_order() {
        let search = fixtures::scenario_search();
        let run = fixtures::decode(&search, &Script::scenario_a());
        assert_eq!(run.outcome.words, vec!["A", "B"]);

        let words: Vec<_> = run
            .outcome
            .segments
            .iter()
            .filter(|s| s.text == "A" || s.text == "B")
            .map(|s| (s.text.as_str(), s.start_frame, s.end_frame))
            .collect();
        assert_eq!(words, vec![("A", 1, 4), ("B", 5, 9)]);
        let b = run.outcome.segments.last().expect("B segment");
        assert_eq!(b.lm_score, -100);
        assert_eq!(b.acoustic_score, -50);
        assert_eq!(run.outcome.path_score, Some(-5300));
    }

    #[test]
    fn two_phone_word_is_recognized_across_its_phone_boundary() {
        let search = FlatSearch::new(&fixtures::config(), fixtures::two_phone_models())
            .expect("two-phone search");
        let run = fixtures::decode(&search, &Script::two_phone_word());
        assert_eq!(run.failed_at, None);
        assert_eq!(run.outcome.words, vec!["C"]);

        let c = run
            .outcome
            .segments
            .iter()
            .find(|s| s.text == "C")
            .expect("C segment");
        assert_eq!((c.start_frame, c.end_frame), (1, 9));
        assert_eq!(c.lm_score, -100);
    }

    #[test]
    fn nodes_carried_to_the_next_frame_are_inside_the_beam() {
        let search = FlatSearch::new(&fixtures::config(), fixtures::two_phone_models())
            .expect("two-phone search");
        let script = Script::two_phone_word();
        let output = ArcBuffer::new("out");
        let mut acoustic = script.acoustic();
        let mut utt = search.start_utterance(&output);
        let beam = search.beams().beam;
        let mut carried = 0;

        for frame in 0..script.frames.len() {
            search.expand_arcs(&mut utt, &script.arcs);
            assert_eq!(
                search.search_frame(&mut utt, &mut acoustic, &output).expect("frame"),
                FrameStatus::Searched
            );
            let thresh = add(utt.best_score(), beam);
            for &w in utt.net.vocab() {
                for id in utt.net.chain_nodes(w) {
                    let hmm = &utt.net.node(id).hmm;
                    if !hmm.is_at(frame + 1) {
                        continue;
                    }
                    carried += 1;
                    assert!(
                        better_than(hmm.best_score(), thresh) || better_than(hmm.in_score(), thresh),
                        "node {id} of word {w} carried past frame {frame} outside the beam"
                    );
                }
            }
        }
        assert!(carried > script.frames.len(), "nodes survive every frame");
    }

    #[test]
    fn forced_renormalization_changes_nothing_but_stored_scores() {
        let plain = fixtures::decode(&fixtures::scenario_search(), &Script::scenario_a());
        let forced_search = fixtures::scenario_search().with_renormalization_interval(3);
        let forced = fixtures::decode(&forced_search, &Script::scenario_a());

        assert!(forced.outcome.stats.renormalizations >= 3);
        assert_eq!(plain.outcome.stats.renormalizations, 0);
        assert_eq!(plain.outcome.words, forced.outcome.words);
        assert_eq!(plain.outcome.segments, forced.outcome.segments);
        assert_eq!(plain.outcome.path_score, forced.outcome.path_score);

        let plain_terminal = plain.outcome.terminal.expect("terminal");
        let forced_terminal = forced.outcome.terminal.expect("terminal");
        assert_ne!(
            plain.bptbl_scores[plain_terminal], forced.bptbl_scores[forced_terminal],
            "stored scores differ by the normalization offset"
        );
    }

    #[test]
    fn exits_respect_the_word_beam() {
        let search = fixtures::scenario_search();
        let script = Script::scenario_a();
        let output = ArcBuffer::new("out");
        let mut acoustic = script.acoustic();
        let mut utt = search.start_utterance(&output);
        let word_beam = search.beams().word_beam;

        for frame in 0..script.frames.len() {
            search.expand_arcs(&mut utt, &script.arcs);
            assert_eq!(
                search.search_frame(&mut utt, &mut acoustic, &output).expect("frame"),
                FrameStatus::Searched
            );
            let best = utt.best_score();
            for i in utt.bptbl().frame_range(frame) {
                let score = utt.bptbl().get(i).score;
                assert!(
                    better_than(score, best + word_beam),
                    "exit {i} at frame {frame} below the word beam"
                );
                assert!(!better_than(score, best), "no exit beats the frame best");
            }
        }
    }

    #[test]
    fn every_exit_is_forwarded_once_in_frame_order() {
        let search = fixtures::scenario_search();
        let run = fixtures::decode(&search, &Script::scenario_a());
        let mut ids: Vec<_> = run.forwarded.iter().filter_map(|a| a.entry).collect();
        ids.sort_unstable();
        let expected: Vec<_> = (0..run.bptbl_scores.len()).collect();
        assert_eq!(ids, expected);

        let mut by_entry = run.forwarded.clone();
        by_entry.sort_by_key(|a| a.entry);
        assert!(
            by_entry.windows(2).all(|w| w[0].end_frame <= w[1].end_frame),
            "entry order follows exit frames"
        );
    }

    #[test]
    fn unreachable_scores_stop_the_search() {
        let search = fixtures::scenario_search();
        let run = fixtures::decode(&search, &Script::degenerate(6));
        assert_eq!(run.failed_at, Some(1));
        assert!(run.outcome.words.is_empty());
        assert_eq!(run.outcome.terminal, None);
    }
}
