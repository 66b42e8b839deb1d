//! Viterbi evaluation, beam pruning and renormalization.

use tracing::info;

use super::active::Generation;
use super::network::{NodeId, WordNetwork};
use super::{FlatSearch, Utterance};
use crate::logmath::{add, better_than, Score, WORST_SCORE};
use crate::model::{FrameIdx, WordId};
use crate::search::bptbl::BpIdx;

impl FlatSearch {
    /// One Viterbi step for every node live in `frame`. Sets the frame's best
    /// score, which never comes from the finish word.
    pub(super) fn eval_frame(&self, utt: &mut Utterance, frame: FrameIdx, senscr: &[Score]) {
        let def = &*self.models.hmm;
        let finish = self.models.dictionary.finish_word();
        let mut best = WORST_SCORE;
        let mut n_chan = 0;
        let Utterance {
            net, active, stats, ..
        } = &mut *utt;

        for &w in active.list(Generation::Current) {
            let ids: Vec<NodeId> = net.chain_nodes(w).collect();
            for id in ids {
                let hmm = &mut net.node_mut(id).hmm;
                if !hmm.is_at(frame) {
                    continue;
                }
                let score = hmm.eval(def, senscr);
                if w != finish && better_than(score, best) {
                    best = score;
                }
                n_chan += 1;
            }
        }

        stats.channels_evaluated += n_chan;
        stats.words_searched += active.list(Generation::Current).len();
        utt.best_score = best;
    }

    /// Beam-prune every node evaluated in `frame`, propagate survivors along
    /// their chains and record word exits.
    pub(super) fn prune(&self, utt: &mut Utterance, frame: FrameIdx) {
        let dict = &*self.models.dictionary;
        let cf = frame;
        let nf = frame + 1;
        let thresh = add(utt.best_score, self.beams.beam);
        let wthresh = add(utt.best_score, self.beams.word_beam);
        let pip = self.beams.phone_penalty;
        let Utterance {
            net, active, bptbl, ..
        } = &mut *utt;

        let current = active.list(Generation::Current).to_vec();
        for w in current {
            let Some(chain) = net.chain(w).copied() else {
                continue;
            };

            let root = net.node(chain.root);
            if root.hmm.is_at(cf) && better_than(root.hmm.best_score(), thresh) {
                let out = root.hmm.out_score();
                let history = root.hmm.out_history();
                let next = root.next;
                net.node_mut(chain.root).hmm.set_frame(nf);
                active.touch(w);

                match next {
                    Some(succ) => {
                        let score = add(out, pip);
                        if better_than(score, thresh) {
                            enter_successors(net, succ, score, history, cf, nf);
                        }
                    }
                    None => {
                        if better_than(out, wthresh) {
                            bptbl.enter(dict, w, history, out, 0, 1);
                        }
                    }
                }
            }

            let rest: Vec<NodeId> = net.chain_nodes(w).skip(1).collect();
            for id in rest {
                // Nodes entered at `nf` by a predecessor above were still
                // evaluated in `cf` and may exit.
                let node = net.node(id);
                if node.hmm.is_before(cf) {
                    continue;
                }
                if !better_than(node.hmm.best_score(), thresh) {
                    if node.hmm.is_at(cf) {
                        net.node_mut(id).hmm.clear();
                    }
                    continue;
                }
                let out = node.hmm.out_score();
                let history = node.hmm.out_history();
                let (rc_id, next) = (node.rc_id, node.next);
                net.node_mut(id).hmm.set_frame(nf);
                active.touch(w);

                match rc_id {
                    Some(rc) => {
                        if better_than(out, wthresh) {
                            bptbl.enter(dict, w, history, out, rc, chain.n_rc);
                        }
                    }
                    None => {
                        let score = add(out, pip);
                        if let Some(succ) = next.filter(|_| better_than(score, thresh)) {
                            enter_successors(net, succ, score, history, cf, nf);
                        }
                    }
                }
            }
        }
    }

    /// Rebase the scores of every node live in `frame` on the previous
    /// frame's best, so the new best is zero.
    pub(super) fn renormalize(&self, utt: &mut Utterance, frame: FrameIdx) {
        let norm = utt.best_score;
        info!(frame, best_score = norm, "renormalizing scores");
        let Utterance {
            net, active, bptbl, stats, ..
        } = &mut *utt;

        for &w in active.list(Generation::Current) {
            let ids: Vec<NodeId> = net.chain_nodes(w).collect();
            for id in ids {
                let hmm = &mut net.node_mut(id).hmm;
                if hmm.is_at(frame) {
                    hmm.normalize(norm);
                }
            }
        }
        bptbl.record_normalization(norm);
        stats.renormalizations += 1;
        utt.best_score = 0;
    }
}

/// Enter `first` or, when it is a tail node, every tail sibling from `first`
/// onwards. A node is entered if it was not live in `cf` or the new score
/// beats its entry score.
fn enter_successors(
    net: &mut WordNetwork,
    first: NodeId,
    score: Score,
    history: Option<BpIdx>,
    cf: FrameIdx,
    nf: FrameIdx,
) {
    let fan_out = net.node(first).rc_id.is_some();
    let mut cur = Some(first);
    while let Some(id) = cur {
        let node = net.node_mut(id);
        if node.hmm.is_before(cf) || better_than(score, node.hmm.in_score()) {
            node.hmm.enter(score, history, nf);
        }
        cur = if fan_out { node.next } else { None };
    }
}

/// Words whose root was left in `cf` without being advanced or re-entered.
pub(super) fn stale_roots<'a>(
    net: &'a WordNetwork,
    words: &'a [WordId],
    cf: FrameIdx,
) -> impl Iterator<Item = NodeId> + 'a {
    words
        .iter()
        .filter_map(|&w| net.chain(w).map(|c| c.root))
        .filter(move |&root| net.node(root).hmm.is_at(cf))
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use crate::buffering::ArcBuffer;
    use crate::search::bptbl::Watermark;

    #[test]
    fn successor_entry_keeps_the_better_score() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        let c = search.dictionary().word_id("C").expect("C");
        utt.net
            .build(c, &*search.models.dictionary, &*search.models.context);
        let tail = utt.net.chain_nodes(c).nth(1).expect("tail");

        enter_successors(&mut utt.net, tail, -50, Some(1), 4, 5);
        assert_eq!(utt.net.node(tail).hmm.in_score(), -50);
        enter_successors(&mut utt.net, tail, -80, Some(2), 4, 5);
        assert_eq!(utt.net.node(tail).hmm.in_score(), -50, "worse entry ignored");
        enter_successors(&mut utt.net, tail, -20, Some(3), 4, 5);
        assert_eq!(utt.net.node(tail).hmm.in_score(), -20);
        assert!(utt.net.node(tail).hmm.is_at(5));
    }

    #[test]
    fn tail_reentered_by_its_root_still_exits() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        utt.bptbl.push_frame(Watermark::UtteranceStart);
        let c = search.dictionary().word_id("C").expect("C");
        utt.net
            .build(c, &*search.models.dictionary, &*search.models.context);
        let root = utt.net.chain(c).expect("C chain").root;
        let tail = utt.net.chain_nodes(c).nth(1).expect("tail");
        utt.net.node_mut(root).hmm.enter(-10, None, 0);
        utt.net.node_mut(tail).hmm.enter(-20, None, 0);
        utt.active.push(Generation::Current, c);

        search.eval_frame(&mut utt, 0, &[0, 0, 0]);
        let tail_out = utt.net.node(tail).hmm.out_score();
        search.prune(&mut utt, 0);

        assert!(utt.net.node(tail).hmm.is_at(1));
        let exit = utt
            .bptbl
            .frame_range(0)
            .find(|&i| utt.bptbl.get(i).word == c)
            .expect("C exits in frame 0");
        assert_eq!(utt.bptbl.get(exit).score, tail_out);
    }

    #[test]
    fn pruned_node_keeps_a_fresh_entry() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        utt.bptbl.push_frame(Watermark::UtteranceStart);
        let c = search.dictionary().word_id("C").expect("C");
        utt.net
            .build(c, &*search.models.dictionary, &*search.models.context);
        let root = utt.net.chain(c).expect("C chain").root;
        let tail = utt.net.chain_nodes(c).nth(1).expect("tail");
        utt.net.node_mut(root).hmm.enter(-10, None, 0);
        utt.net.node_mut(tail).hmm.enter(WORST_SCORE / 2, None, 0);
        utt.active.push(Generation::Current, c);

        search.eval_frame(&mut utt, 0, &[0, 0, 0]);
        search.prune(&mut utt, 0);

        let hmm = &utt.net.node(tail).hmm;
        assert!(hmm.is_at(1));
        assert!(hmm.in_score() > WORST_SCORE / 2, "entry from the root survives");
        assert!(!utt
            .bptbl
            .frame_range(0)
            .any(|i| utt.bptbl.get(i).word == c));
    }

    #[test]
    fn renormalize_zeroes_the_best_and_records_the_offset() {
        let search = fixtures::scenario_search();
        let output = ArcBuffer::new("out");
        let mut utt = search.start_utterance(&output);
        utt.bptbl.push_frame(Watermark::UtteranceStart);
        utt.best_score = -700;
        let root = utt
            .net
            .chain(search.dictionary().start_word())
            .expect("start chain")
            .root;

        search.renormalize(&mut utt, 0);
        assert_eq!(utt.best_score, 0);
        assert_eq!(utt.net.node(root).hmm.in_score(), 700);
        assert_eq!(utt.stats.renormalizations, 1);
    }
}
