//! Many-to-one vocabulary map between the upstream pass and this one.
//!
//! The upstream pass may search a reduced vocabulary in which several words
//! are collapsed into one class word. Each line of the map file reads
//!
//! ```text
//! <dictionary-word> <upstream-word>
//! ```
//!
//! and arcs carrying `<upstream-word>` are expanded to every dictionary word
//! mapped onto it. Blank lines and `#` comments are ignored.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::error::{Result, SearchError};
use crate::model::{Dictionary, WordId};

#[derive(Debug, Clone, Default)]
pub struct VocabMap {
    unmap: HashMap<WordId, Vec<WordId>>,
}

impl VocabMap {
    /// Parse a map, resolving both columns against `dict`.
    pub fn read<R: BufRead>(reader: R, dict: &dyn Dictionary) -> Result<Self> {
        let mut unmap: HashMap<WordId, Vec<WordId>> = HashMap::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let lineno = n + 1;
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let fields: Vec<&str> = content.split_whitespace().collect();
            let &[word, upstream] = fields.as_slice() else {
                return Err(SearchError::VocabMapParse {
                    line: lineno,
                    reason: format!("expected 2 fields, found {}", fields.len()),
                });
            };
            let resolve = |w: &str| {
                dict.word_id(w).ok_or_else(|| SearchError::VocabMapParse {
                    line: lineno,
                    reason: format!("unknown word {w:?}"),
                })
            };
            let word = resolve(word)?;
            let upstream = resolve(upstream)?;
            let targets = unmap.entry(upstream).or_default();
            if !targets.contains(&word) {
                targets.push(word);
            }
        }
        info!(classes = unmap.len(), "vocabulary map loaded");
        Ok(Self { unmap })
    }

    pub fn load(path: &Path, dict: &dyn Dictionary) -> Result<Self> {
        let file = File::open(path).map_err(|source| SearchError::VocabMapIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::read(BufReader::new(file), dict)
    }

    /// Dictionary words an upstream word stands for, or `None` if it is not
    /// mapped and should be expanded as itself.
    pub fn unmap(&self, upstream: WordId) -> Option<&[WordId]> {
        self.unmap.get(&upstream).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.unmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unmap.is_empty()
    }
}
