//! In-memory, table-backed collaborators.
//!
//! Used by the test suite and the synthetic benchmark so the full search can
//! be exercised without binary model files. They are small but complete:
//! alternate pronunciations, fillers, back-off n-grams and a
//! context-independent phone set.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Result, SearchError};
use crate::logmath::{Score, WORST_SCORE};
use crate::model::{
    Dictionary, LanguageModel, PhoneContext, PhoneId, RightContext, SsId, TmatId, WordId,
};

/// Sentence-start marker.
pub const START_WORD: &str = "<s>";
/// Sentence-end marker.
pub const FINISH_WORD: &str = "</s>";
/// Silence word.
pub const SILENCE_WORD: &str = "<sil>";

#[derive(Debug, Clone)]
struct DictEntry {
    word: String,
    phones: Vec<PhoneId>,
    base: WordId,
    filler: bool,
}

/// Dictionary held in memory.
///
/// `"word(2)"` style entries are alternates of `"word"`, which must be added
/// first.
#[derive(Debug, Clone)]
pub struct TableDictionary {
    entries: Vec<DictEntry>,
    index: HashMap<String, WordId>,
    start: WordId,
    finish: WordId,
    silence: WordId,
}

impl TableDictionary {
    /// Create a dictionary whose start, finish and silence words are
    /// pronounced with `silence_phone`.
    pub fn new(silence_phone: PhoneId) -> Self {
        let mut dict = Self {
            entries: Vec::new(),
            index: HashMap::new(),
            start: 0,
            finish: 0,
            silence: 0,
        };
        dict.start = dict.insert(START_WORD, vec![silence_phone], true);
        dict.finish = dict.insert(FINISH_WORD, vec![silence_phone], true);
        dict.silence = dict.insert(SILENCE_WORD, vec![silence_phone], true);
        dict
    }

    /// Add a word. Returns its id.
    pub fn add_word(&mut self, word: &str, phones: &[PhoneId]) -> Result<WordId> {
        self.add(word, phones, false)
    }

    /// Add a noise/filler word.
    pub fn add_filler(&mut self, word: &str, phones: &[PhoneId]) -> Result<WordId> {
        self.add(word, phones, true)
    }

    fn add(&mut self, word: &str, phones: &[PhoneId], filler: bool) -> Result<WordId> {
        if phones.is_empty() {
            return Err(SearchError::MalformedPronunciation {
                word: word.into(),
                reason: "empty pronunciation".into(),
            });
        }
        if self.index.contains_key(word) {
            return Err(SearchError::MalformedPronunciation {
                word: word.into(),
                reason: "duplicate entry".into(),
            });
        }
        Ok(self.insert(word, phones.to_vec(), filler))
    }

    fn insert(&mut self, word: &str, phones: Vec<PhoneId>, filler: bool) -> WordId {
        let id = self.entries.len();
        let base = alternate_base(word)
            .and_then(|b| self.index.get(b).copied())
            .unwrap_or(id);
        self.entries.push(DictEntry {
            word: word.to_string(),
            phones,
            base,
            filler,
        });
        self.index.insert(word.to_string(), id);
        id
    }
}

/// `"word(2)"` → `Some("word")`.
fn alternate_base(word: &str) -> Option<&str> {
    let open = word.rfind('(')?;
    let inner = word.strip_suffix(')')?.get(open + 1..)?;
    (open > 0 && !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()))
        .then(|| &word[..open])
}

impl Dictionary for TableDictionary {
    fn word_count(&self) -> usize {
        self.entries.len()
    }

    fn word_str(&self, word: WordId) -> &str {
        &self.entries[word].word
    }

    fn word_id(&self, word: &str) -> Option<WordId> {
        self.index.get(word).copied()
    }

    fn phone_count(&self, word: WordId) -> usize {
        self.entries[word].phones.len()
    }

    fn phone_at(&self, word: WordId, pos: usize) -> PhoneId {
        self.entries[word].phones[pos]
    }

    fn base_word(&self, word: WordId) -> WordId {
        self.entries[word].base
    }

    fn is_filler(&self, word: WordId) -> bool {
        self.entries[word].filler
    }

    fn start_word(&self) -> WordId {
        self.start
    }

    fn finish_word(&self) -> WordId {
        self.finish
    }

    fn silence_word(&self) -> WordId {
        self.silence
    }
}

/// Back-off n-gram table over dictionary base word ids.
///
/// Lookups try the trigram, then the bigram, then the unigram; a missing
/// higher order adds `backoff` once per order skipped.
#[derive(Debug, Clone, Default)]
pub struct TableLanguageModel {
    unigrams: HashMap<WordId, Score>,
    bigrams: HashMap<(WordId, WordId), Score>,
    trigrams: HashMap<(WordId, WordId, WordId), Score>,
    backoff: Score,
}

impl TableLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: Score) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn unigram(mut self, word: WordId, score: Score) -> Self {
        self.unigrams.insert(word, score);
        self
    }

    pub fn bigram(mut self, prev: WordId, word: WordId, score: Score) -> Self {
        self.bigrams.insert((prev, word), score);
        self
    }

    pub fn trigram(mut self, prev_prev: WordId, prev: WordId, word: WordId, score: Score) -> Self {
        self.trigrams.insert((prev_prev, prev, word), score);
        self
    }
}

impl LanguageModel for TableLanguageModel {
    fn trigram_score(
        &self,
        word: WordId,
        prev: WordId,
        prev_prev: Option<WordId>,
    ) -> (Score, usize) {
        if let Some(&s) = prev_prev.and_then(|pp| self.trigrams.get(&(pp, prev, word))) {
            return (s, 3);
        }
        let skipped = if prev_prev.is_some() { self.backoff } else { 0 };
        if let Some(&s) = self.bigrams.get(&(prev, word)) {
            return (s + skipped, 2);
        }
        match self.unigrams.get(&word) {
            Some(&s) => (s + skipped + self.backoff, 1),
            None => (WORST_SCORE, 0),
        }
    }

    fn is_known_word(&self, word: WordId) -> bool {
        self.unigrams.contains_key(&word)
    }
}

/// Context-independent phone set: every phone has one senone sequence
/// (`ssid == phone`) and one transition matrix, whatever its neighbours.
#[derive(Debug, Clone)]
pub struct ContextIndependent {
    n_phones: usize,
    silence: PhoneId,
    tmats: Vec<TmatId>,
    right: Vec<RightContext>,
}

impl ContextIndependent {
    /// All phones share transition matrix 0.
    pub fn new(n_phones: usize, silence: PhoneId) -> Self {
        Self::with_tmats(vec![0; n_phones], silence)
    }

    pub fn with_tmats(tmats: Vec<TmatId>, silence: PhoneId) -> Self {
        let n_phones = tmats.len();
        let right = (0..n_phones)
            .map(|p| RightContext::compress(&vec![p; n_phones]))
            .collect();
        debug!(n_phones, "context-independent phone set");
        Self {
            n_phones,
            silence,
            tmats,
            right,
        }
    }
}

impl PhoneContext for ContextIndependent {
    fn phone_count(&self) -> usize {
        self.n_phones
    }

    fn silence_phone(&self) -> PhoneId {
        self.silence
    }

    fn ci_ssid(&self, phone: PhoneId) -> SsId {
        phone
    }

    fn tmat(&self, phone: PhoneId) -> TmatId {
        self.tmats[phone]
    }

    fn internal_ssid(&self, _left: PhoneId, phone: PhoneId, _right: PhoneId) -> SsId {
        phone
    }

    fn right_context(&self, last: PhoneId, _second_last: PhoneId) -> &RightContext {
        &self.right[last]
    }

    fn left_diphone_ssid(&self, first: PhoneId, _second: PhoneId, _left: PhoneId) -> SsId {
        first
    }
}
