//! Double-buffered active word lists.
//!
//! `Current` holds the words with live nodes in the frame being searched;
//! `Next` is rebuilt from the per-word "touched" markers set while pruning
//! and transitioning, then the two are swapped at the frame boundary.

use crate::hmm::HmmDefinition;
use crate::model::{FrameIdx, WordId};
use crate::search::bptbl::Watermark;
use crate::search::network::WordNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Generation {
    Current = 0,
    Next = 1,
}

#[derive(Debug, Default)]
pub(crate) struct ActiveLists {
    words: [Vec<WordId>; 2],
    touched: Vec<bool>,
    senones: Vec<bool>,
    n_senones_active: usize,
}

impl ActiveLists {
    pub fn new(n_words: usize, n_senones: usize) -> Self {
        Self {
            words: [Vec::new(), Vec::new()],
            touched: vec![false; n_words],
            senones: vec![false; n_senones],
            n_senones_active: 0,
        }
    }

    pub fn list(&self, generation: Generation) -> &[WordId] {
        &self.words[generation as usize]
    }

    pub fn push(&mut self, generation: Generation, word: WordId) {
        self.words[generation as usize].push(word);
    }

    /// Mark `word` live for the next frame.
    pub fn touch(&mut self, word: WordId) {
        self.touched[word] = true;
    }

    /// Senones read by nodes live in the last computed frame.
    pub fn senones(&self) -> &[bool] {
        &self.senones
    }

    pub fn n_senones_active(&self) -> usize {
        self.n_senones_active
    }

    /// Mark the senones of every node at `frame` and find the oldest
    /// backpointer they reference.
    pub fn compute_active(
        &mut self,
        frame: FrameIdx,
        net: &WordNetwork,
        def: &HmmDefinition,
    ) -> Watermark {
        self.senones.iter_mut().for_each(|s| *s = false);
        let mut oldest = Watermark::Empty;
        for &w in &self.words[Generation::Current as usize] {
            for id in net.chain_nodes(w) {
                let hmm = &net.node(id).hmm;
                if !hmm.is_at(frame) {
                    continue;
                }
                hmm.activate(def, &mut self.senones);
                if let Some(h) = hmm.oldest_history(def.n_emit_state()) {
                    oldest = oldest.include(h);
                }
            }
        }
        self.n_senones_active = self.senones.iter().filter(|&&s| s).count();
        oldest
    }

    /// Compact the touched markers into the `Next` list, in utterance
    /// vocabulary order, clearing them.
    pub fn build_next(&mut self, net: &WordNetwork) {
        let next = &mut self.words[Generation::Next as usize];
        next.clear();
        for &w in net.vocab() {
            if std::mem::take(&mut self.touched[w]) {
                next.push(w);
            }
        }
    }

    /// Make `Next` current.
    pub fn swap(&mut self) {
        self.words.swap(0, 1);
        self.words[Generation::Next as usize].clear();
    }
}
