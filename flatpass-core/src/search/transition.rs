//! Cross-word transitions and language-model rescoring.
//!
//! Every exit recorded in the frame just pruned is offered to every candidate
//! word of the arc window:
//!
//! ```text
//! score = rc_score[first phone of successor]     (the exit's right context)
//!       + lm(successor | real word, prev real word) · lm_weight
//!       + word insertion penalty
//! ```
//!
//! Silence and fillers are not rescored. They are offered once per frame from
//! the best silence-context exit, with fixed penalties in place of the LM.

use super::active::Generation;
use super::bptbl::BpIdx;
use super::evaluate::stale_roots;
use super::{FlatSearch, Utterance};
use crate::logmath::{add, better_than, is_reachable, Score, WORST_SCORE};
use crate::model::{FrameIdx, PhoneId, WordId};

impl FlatSearch {
    pub(super) fn word_transition(&self, utt: &mut Utterance, frame: FrameIdx) {
        let dict = &*self.models.dictionary;
        let ctx = &*self.models.context;
        let cf = frame;
        let nf = frame + 1;
        let thresh = add(utt.best_score, self.beams.beam);
        let wip = self.beams.word_penalty;
        let silence_phone = ctx.silence_phone();

        utt.expand.clear();
        utt.expand.extend(
            utt.net
                .vocab()
                .iter()
                .copied()
                .filter(|&w| utt.expand_marks[w]),
        );
        utt.stats.word_transitions += utt.expand.len();

        let mut best_sil: Option<(Score, BpIdx)> = None;
        let expand = std::mem::take(&mut utt.expand);
        for b in utt.bptbl.frame_range(cf) {
            let ent = utt.bptbl.get(b).clone();
            if ent.word == dict.finish_word() {
                continue;
            }
            let rc = ent
                .second_last_phone
                .map(|sl| ctx.right_context(ent.last_phone, sl));
            let rc_score = |phone: PhoneId| -> Score {
                let rcss = utt.bptbl.rc_scores(b);
                match rc {
                    Some(rc) if rcss.len() > 1 => rcss[rc.cimap[phone]],
                    _ => rcss[0],
                }
            };

            let sil_score = rc_score(silence_phone);
            if better_than(sil_score, best_sil.map_or(WORST_SCORE, |(s, _)| s)) {
                best_sil = Some((sil_score, b));
            }

            let mut entered: Vec<(WordId, Score)> = Vec::new();
            for &w in &expand {
                let exit = rc_score(dict.first_phone(w));
                if !is_reachable(exit) {
                    continue;
                }
                let lm = self.lm_score(dict.base_word(w), ent.real_word, ent.prev_real_word);
                let score = add(add(exit, lm), wip);
                if better_than(score, thresh) {
                    entered.push((w, score));
                }
            }

            let left = dict.last_phone(ent.word);
            for (w, score) in entered {
                let Some(chain) = utt.net.chain(w).copied() else {
                    continue;
                };
                let hmm = &mut utt.net.node_mut(chain.root).hmm;
                if hmm.is_before(cf) || better_than(score, hmm.in_score()) {
                    hmm.enter(score, Some(b), nf);
                    if hmm.is_mpx() {
                        hmm.set_entry_ssid(ctx.left_diphone_ssid(
                            chain.ciphone,
                            chain.ci2phone,
                            left,
                        ));
                    }
                    utt.active.touch(w);
                }
            }
        }
        utt.expand = expand;

        if let Some((sil_score, bp)) = best_sil {
            let silence = dict.silence_word();
            let score = add(add(sil_score, self.beams.silence_penalty), wip);
            self.enter_filler(utt, silence, score, bp, thresh, cf);

            let score = add(add(sil_score, self.beams.filler_penalty), wip);
            for &w in &self.fillers {
                self.enter_filler(utt, w, score, bp, thresh, cf);
            }
        }

        let stale: Vec<_> = stale_roots(&utt.net, utt.active.list(Generation::Current), cf).collect();
        for root in stale {
            utt.net.node_mut(root).hmm.clear();
        }
    }

    fn enter_filler(
        &self,
        utt: &mut Utterance,
        word: WordId,
        score: Score,
        history: BpIdx,
        thresh: Score,
        cf: FrameIdx,
    ) {
        if !better_than(score, thresh) || !is_reachable(score) {
            return;
        }
        let Some(chain) = utt.net.chain(word).copied() else {
            return;
        };
        let hmm = &mut utt.net.node_mut(chain.root).hmm;
        if hmm.is_before(cf) || better_than(score, hmm.in_score()) {
            hmm.enter(score, Some(history), cf + 1);
            utt.active.touch(word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::bptbl::Watermark;
    use super::super::fixtures;
    use crate::buffering::{ArcBuffer, WordArc};

    #[test]
    fn exits_enter_candidate_roots_with_lm_and_history() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        let dict = search.dictionary();
        let a = dict.word_id("A").expect("A");
        let b = dict.word_id("B").expect("B");
        search.expand_arcs(&mut utt, &[WordArc::hint(b, 5, 9)]);

        utt.bptbl.push_frame(Watermark::UtteranceStart);
        let exit = utt.bptbl.enter(dict, a, None, -1000, 0, 1);
        utt.best_score = -1000;
        search.word_transition(&mut utt, 0);

        let root = utt.net.chain(b).expect("B chain").root;
        let hmm = &utt.net.node(root).hmm;
        assert!(hmm.is_at(1));
        assert_eq!(hmm.in_score(), -1100, "unigram -100, no insertion penalty");
        assert_eq!(hmm.oldest_history(1), Some(Some(exit)));
        assert_eq!(utt.stats.word_transitions, 1);
    }

    #[test]
    fn finish_word_exits_are_never_extended() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        let dict = search.dictionary();
        let b = dict.word_id("B").expect("B");
        search.expand_arcs(&mut utt, &[WordArc::hint(b, 0, 9)]);

        utt.bptbl.push_frame(Watermark::UtteranceStart);
        utt.bptbl.enter(dict, dict.finish_word(), None, 0, 0, 1);
        utt.best_score = 0;
        search.word_transition(&mut utt, 0);

        let root = utt.net.chain(b).expect("B chain").root;
        assert!(!utt.net.node(root).hmm.is_at(1));
        let sil = utt.net.chain(dict.silence_word()).expect("silence").root;
        assert!(!utt.net.node(sil).hmm.is_at(1));
    }

    #[test]
    fn silence_follows_the_best_exit_with_its_penalty() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        let dict = search.dictionary();
        let a = dict.word_id("A").expect("A");
        let b = dict.word_id("B").expect("B");

        utt.bptbl.push_frame(Watermark::UtteranceStart);
        utt.bptbl.enter(dict, a, None, -300, 0, 1);
        let best = utt.bptbl.enter(dict, b, None, -200, 0, 1);
        utt.best_score = -200;
        search.word_transition(&mut utt, 0);

        let sil = utt.net.chain(dict.silence_word()).expect("silence").root;
        let hmm = &utt.net.node(sil).hmm;
        assert!(hmm.is_at(1));
        assert_eq!(hmm.in_score(), -200 + search.beams().silence_penalty);
        assert_eq!(hmm.oldest_history(1), Some(Some(best)));
    }
}
