//! External collaborators of the search.
//!
//! The search never owns pronunciation storage, n-gram lookup internals or
//! acoustic scoring. It consumes them through the traits below, so any backend
//! (binary model files, a remote acoustic stage, the in-memory tables in
//! [`stub`]) can be plugged in without touching the search.

pub mod stub;
pub mod vocab_map;

pub use vocab_map::VocabMap;

use std::sync::Arc;
use std::time::Duration;

use crate::buffering::WaitStatus;
use crate::logmath::Score;

/// Dictionary word index.
pub type WordId = usize;
/// Context-independent phone index.
pub type PhoneId = usize;
/// Senone-sequence index (one per distinct triphone state sequence).
pub type SsId = usize;
/// Transition-matrix index.
pub type TmatId = usize;
/// Senone index into a frame's score vector.
pub type SenoneId = usize;
/// Acoustic frame index within an utterance.
pub type FrameIdx = usize;

/// Pronunciation dictionary.
///
/// Every word must have at least one phone. `start_word`, `finish_word` and
/// `silence_word` are distinct entries; fillers are every other word with
/// `is_filler() == true`.
pub trait Dictionary: Send + Sync {
    fn word_count(&self) -> usize;

    fn word_str(&self, word: WordId) -> &str;

    fn word_id(&self, word: &str) -> Option<WordId>;

    fn phone_count(&self, word: WordId) -> usize;

    fn phone_at(&self, word: WordId, pos: usize) -> PhoneId;

    fn is_single_phone(&self, word: WordId) -> bool {
        self.phone_count(word) == 1
    }

    /// The word an alternate pronunciation belongs to (itself for base words).
    fn base_word(&self, word: WordId) -> WordId;

    fn is_filler(&self, word: WordId) -> bool;

    fn start_word(&self) -> WordId;

    fn finish_word(&self) -> WordId;

    fn silence_word(&self) -> WordId;

    fn first_phone(&self, word: WordId) -> PhoneId {
        self.phone_at(word, 0)
    }

    fn last_phone(&self, word: WordId) -> PhoneId {
        self.phone_at(word, self.phone_count(word) - 1)
    }

    /// Filler words other than start, finish and silence.
    fn filler_words(&self) -> Vec<WordId> {
        let special = [self.start_word(), self.finish_word(), self.silence_word()];
        (0..self.word_count())
            .filter(|&w| self.is_filler(w) && !special.contains(&w))
            .collect()
    }
}

/// N-gram scoring interface. Word ids are dictionary base word ids.
pub trait LanguageModel: Send + Sync {
    /// Score of `word` following `prev` (and `prev_prev`), with the n-gram
    /// order actually used.
    fn trigram_score(
        &self,
        word: WordId,
        prev: WordId,
        prev_prev: Option<WordId>,
    ) -> (Score, usize);

    fn is_known_word(&self, word: WordId) -> bool;
}

/// Right-context fan-out for a word-final diphone.
///
/// `ssids` holds one entry per *distinct* senone sequence required across all
/// following phones; `cimap[phone]` is the index into `ssids` used when the
/// next word starts with `phone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RightContext {
    pub ssids: Vec<SsId>,
    pub cimap: Vec<usize>,
}

impl RightContext {
    /// Compress a per-following-phone senone sequence table, keeping the first
    /// occurrence order of each distinct sequence.
    pub fn compress(per_phone: &[SsId]) -> Self {
        let mut ssids: Vec<SsId> = Vec::new();
        let cimap = per_phone
            .iter()
            .map(|ssid| match ssids.iter().position(|s| s == ssid) {
                Some(i) => i,
                None => {
                    ssids.push(*ssid);
                    ssids.len() - 1
                }
            })
            .collect();
        Self { ssids, cimap }
    }

    pub fn len(&self) -> usize {
        self.ssids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ssids.is_empty()
    }
}

/// Phone-in-context to senone-sequence mapping (the acoustic model definition).
pub trait PhoneContext: Send + Sync {
    fn phone_count(&self) -> usize;

    fn silence_phone(&self) -> PhoneId;

    /// Context-independent sequence for `phone`.
    fn ci_ssid(&self, phone: PhoneId) -> SsId;

    fn tmat(&self, phone: PhoneId) -> TmatId;

    /// Sequence for a word-internal phone between `left` and `right`.
    fn internal_ssid(&self, left: PhoneId, phone: PhoneId, right: PhoneId) -> SsId;

    /// Fan-out for a word ending in `second_last`, `last`.
    fn right_context(&self, last: PhoneId, second_last: PhoneId) -> &RightContext;

    /// Sequence for a word-initial `first` (followed by `second`) entered
    /// after a word ending in `left`.
    fn left_diphone_ssid(&self, first: PhoneId, second: PhoneId, left: PhoneId) -> SsId;
}

/// Consumer side of the acoustic stage.
///
/// Frames are scored upstream; the search only waits for them, reads them in
/// strictly increasing order and releases them when done.
pub trait AcousticModel: Send + 'static {
    /// Wait for the producer to begin an utterance.
    fn start_utterance(&mut self, timeout: Option<Duration>) -> WaitStatus;

    /// Wait until `frame` is available. `EndOfUtterance` means no frame with
    /// this index will ever arrive.
    fn wait_for_frame(&mut self, frame: FrameIdx, timeout: Option<Duration>) -> WaitStatus;

    /// Senone scores of `frame`, or `None` if it is not (yet) available.
    fn score_frame(&mut self, frame: FrameIdx) -> Option<Arc<[Score]>>;

    fn is_end_of_utterance(&self) -> bool;

    /// The search will not read `frame` again.
    fn release_frame(&mut self, frame: FrameIdx);

    /// Drop all per-utterance state.
    fn end_utterance(&mut self);

    /// Senones referenced by live HMMs for the next frame. Backends that
    /// compute scores lazily may restrict themselves to this set.
    fn activate_senones(&mut self, _active: &[bool]) {}
}
