//! Per-utterance word network.
//!
//! Every word in the utterance vocabulary owns a linear chain of phone nodes
//! allocated from one arena:
//!
//! ```text
//! root ─► internal ─► … ─► internal ─► tail(rc 0) ─► tail(rc 1) ─► …
//! ```
//!
//! Tail nodes are siblings: the last internal node (or the root of a
//! two-phone word) feeds all of them, one per distinct right-context senone
//! sequence. Single-phone words are a lone root that exits directly.

use tracing::trace;

use crate::hmm::Hmm;
use crate::model::{Dictionary, PhoneContext, PhoneId, WordId};

/// Index of a node in the arena.
pub(crate) type NodeId = usize;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub hmm: Hmm,
    /// Right-context slot for tail nodes.
    pub rc_id: Option<usize>,
    pub next: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Chain {
    pub root: NodeId,
    pub ciphone: PhoneId,
    /// Second phone, or silence for single-phone words.
    pub ci2phone: PhoneId,
    /// Number of right-context exit slots.
    pub n_rc: usize,
}

#[derive(Debug, Default)]
pub(crate) struct WordNetwork {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    chains: Vec<Option<Chain>>,
    /// Words with a chain, in build order.
    vocab: Vec<WordId>,
}

impl WordNetwork {
    pub fn new(n_words: usize) -> Self {
        Self {
            chains: vec![None; n_words],
            ..Self::default()
        }
    }

    pub fn chain(&self, word: WordId) -> Option<&Chain> {
        self.chains[word].as_ref()
    }

    pub fn is_built(&self, word: WordId) -> bool {
        self.chains[word].is_some()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn vocab(&self) -> &[WordId] {
        &self.vocab
    }

    /// Live (allocated) nodes.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Node ids of `word`'s chain, root first.
    pub fn chain_nodes(&self, word: WordId) -> ChainIter<'_> {
        ChainIter {
            net: self,
            cur: self.chains[word].map(|c| c.root),
        }
    }

    /// Build `word`'s chain. Returns `false` if it already exists.
    pub fn build(&mut self, word: WordId, dict: &dyn Dictionary, ctx: &dyn PhoneContext) -> bool {
        if self.is_built(word) {
            return false;
        }
        let n_phones = dict.phone_count(word);
        let phone = |i| dict.phone_at(word, i);
        let ciphone = phone(0);
        let silence = ctx.silence_phone();

        let (root_hmm, ci2phone) = if dict.is_filler(word) {
            (Hmm::new(false, ctx.ci_ssid(ciphone), ctx.tmat(ciphone)), silence)
        } else {
            let ci2 = if n_phones > 1 { phone(1) } else { silence };
            let ssid = ctx.left_diphone_ssid(ciphone, ci2, silence);
            (Hmm::new(true, ssid, ctx.tmat(ciphone)), ci2)
        };
        let root = self.alloc(root_hmm, None);

        let mut n_rc = 1;
        let mut prev = root;
        if n_phones > 1 {
            for i in 1..n_phones - 1 {
                let p = phone(i);
                let ssid = ctx.internal_ssid(phone(i - 1), p, phone(i + 1));
                let id = self.alloc(Hmm::new(false, ssid, ctx.tmat(p)), None);
                self.nodes[prev].next = Some(id);
                prev = id;
            }
            let last = phone(n_phones - 1);
            let rc = ctx.right_context(last, phone(n_phones - 2));
            n_rc = rc.len();
            for (k, &ssid) in rc.ssids.iter().enumerate() {
                let id = self.alloc(Hmm::new(false, ssid, ctx.tmat(last)), Some(k));
                self.nodes[prev].next = Some(id);
                prev = id;
            }
        }

        self.chains[word] = Some(Chain {
            root,
            ciphone,
            ci2phone,
            n_rc,
        });
        self.vocab.push(word);
        trace!(word, n_phones, n_rc, "chain built");
        true
    }

    /// Free `word`'s chain.
    pub fn destroy(&mut self, word: WordId) {
        let ids: Vec<NodeId> = self.chain_nodes(word).collect();
        self.free.extend(ids);
        self.chains[word] = None;
        self.vocab.retain(|&w| w != word);
    }

    /// Free every chain at utterance end.
    pub fn destroy_all(&mut self) {
        for word in std::mem::take(&mut self.vocab) {
            self.destroy(word);
        }
        debug_assert_eq!(self.n_nodes(), 0, "chains leaked");
        self.nodes.clear();
        self.free.clear();
    }

    fn alloc(&mut self, hmm: Hmm, rc_id: Option<usize>) -> NodeId {
        let node = Node {
            hmm,
            rc_id,
            next: None,
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}

pub(crate) struct ChainIter<'a> {
    net: &'a WordNetwork,
    cur: Option<NodeId>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.net.nodes[id].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stub::{ContextIndependent, TableDictionary};
    use crate::model::RightContext;
    use crate::model::{SsId, TmatId};

    /// Phone set where the right context of every word-final phone splits on
    /// whether the next phone is silence.
    struct SplitRight {
        inner: ContextIndependent,
        rc: RightContext,
    }

    impl PhoneContext for SplitRight {
        fn phone_count(&self) -> usize {
            self.inner.phone_count()
        }
        fn silence_phone(&self) -> PhoneId {
            0
        }
        fn ci_ssid(&self, phone: PhoneId) -> SsId {
            phone
        }
        fn tmat(&self, _phone: PhoneId) -> TmatId {
            0
        }
        fn internal_ssid(&self, _l: PhoneId, phone: PhoneId, _r: PhoneId) -> SsId {
            phone
        }
        fn right_context(&self, _last: PhoneId, _second_last: PhoneId) -> &RightContext {
            &self.rc
        }
        fn left_diphone_ssid(&self, first: PhoneId, _second: PhoneId, _left: PhoneId) -> SsId {
            first
        }
    }

    fn split_ctx() -> SplitRight {
        SplitRight {
            inner: ContextIndependent::new(4, 0),
            rc: RightContext::compress(&[10, 11, 11, 11]),
        }
    }

    #[test]
    fn multi_phone_word_gets_one_tail_per_distinct_context() {
        let ctx = split_ctx();
        let mut dict = TableDictionary::new(0);
        let w = dict.add_word("abc", &[1, 2, 3]).expect("abc");
        let mut net = WordNetwork::new(dict.word_count());

        assert!(net.build(w, &dict, &ctx));
        let nodes: Vec<_> = net.chain_nodes(w).collect();
        assert_eq!(nodes.len(), 4, "root, one internal, two tails");
        let rc_ids: Vec<_> = nodes.iter().map(|&n| net.node(n).rc_id).collect();
        assert_eq!(rc_ids, vec![None, None, Some(0), Some(1)]);
        assert_eq!(net.chain(w).map(|c| c.n_rc), Some(2));
        assert!(net.node(nodes[0]).hmm.is_mpx());
    }

    #[test]
    fn rebuilding_is_a_no_op() {
        let ctx = split_ctx();
        let mut dict = TableDictionary::new(0);
        let w = dict.add_word("ab", &[1, 2]).expect("ab");
        let mut net = WordNetwork::new(dict.word_count());
        assert!(net.build(w, &dict, &ctx));
        let before = net.n_nodes();
        assert!(!net.build(w, &dict, &ctx));
        assert_eq!(net.n_nodes(), before);
        assert_eq!(net.vocab(), &[w]);
    }

    #[test]
    fn single_phone_and_filler_words_are_lone_roots() {
        let ctx = split_ctx();
        let mut dict = TableDictionary::new(0);
        let a = dict.add_word("a", &[1]).expect("a");
        let sil = dict.silence_word();
        let mut net = WordNetwork::new(dict.word_count());
        net.build(a, &dict, &ctx);
        net.build(sil, &dict, &ctx);
        assert_eq!(net.chain_nodes(a).count(), 1);
        assert_eq!(net.chain(a).map(|c| c.ci2phone), Some(0));
        assert!(!net.node(net.chain(sil).expect("sil").root).hmm.is_mpx());
    }

    #[test]
    fn destroyed_nodes_are_reused() {
        let ctx = split_ctx();
        let mut dict = TableDictionary::new(0);
        let a = dict.add_word("abc", &[1, 2, 3]).expect("abc");
        let b = dict.add_word("cba", &[3, 2, 1]).expect("cba");
        let mut net = WordNetwork::new(dict.word_count());
        net.build(a, &dict, &ctx);
        net.destroy(a);
        assert_eq!(net.n_nodes(), 0);
        net.build(b, &dict, &ctx);
        assert_eq!(net.n_nodes(), 4);
        net.destroy_all();
        assert!(net.vocab().is_empty());
        assert!(!net.is_built(b));
    }
}
