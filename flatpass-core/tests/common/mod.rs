#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flatpass_core::hmm::{HmmDefinition, TransitionMatrix};
use flatpass_core::model::stub::{ContextIndependent, TableDictionary, TableLanguageModel};
use flatpass_core::{
    ArcBuffer, Dictionary, FrameProducer, Score, SearchConfig, SearchModels, UtteranceEvent,
    WaitStatus, WordArc,
};
use tokio::sync::broadcast;

/// Dictionary ids after the three special words.
pub const A: usize = 3;
pub const B: usize = 4;
pub const CLASS: usize = 6;

/// Phones `SIL a b` with one senone each. Words `A = a`, `B = b`, `C = a b`
/// (no unigram) and `CLASS = a` (no unigram, stands in for upstream classes).
pub fn models() -> SearchModels {
    let mut dict = TableDictionary::new(0);
    let a = dict.add_word("A", &[1]).expect("A");
    let b = dict.add_word("B", &[2]).expect("B");
    dict.add_word("C", &[1, 2]).expect("C");
    let class = dict.add_word("CLASS", &[1]).expect("CLASS");
    assert_eq!((a, b, class), (A, B, CLASS));

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

pub fn config() -> SearchConfig {
    SearchConfig {
        word_insertion_prob: 1.0,
        silence_prob: 1e-3,
        ..SearchConfig::default()
    }
}

/// `a` wins frames 0-4, `b` wins frames 5-9.
pub fn two_word_frames() -> Vec<Vec<Score>> {
    (0..10)
        .map(|f| {
            let hot = if f < 5 { 1 } else { 2 };
            (0..3).map(|s| if s == hot { 0 } else { -5000 }).collect()
        })
        .collect()
}

pub fn two_word_arcs() -> Vec<WordArc> {
    vec![WordArc::hint(A, 0, 4), WordArc::hint(B, 5, 9)]
}

/// Feed one utterance of frames on a background thread.
pub fn feed_frames(producer: FrameProducer, frames: Vec<Vec<Score>>) -> JoinHandle<()> {
    thread::spawn(move || {
        producer.start_utterance().expect("frame start");
        for frame in frames {
            producer.push_frame(frame).expect("frame");
        }
        producer.end_utterance().expect("frame end");
    })
}

/// Collect every arc the search forwards for one utterance.
pub fn collect_output(output: Arc<ArcBuffer>) -> JoinHandle<(WaitStatus, Vec<WordArc>)> {
    thread::spawn(move || {
        let status = output.wait_for_start(Some(Duration::from_secs(5)));
        if status != WaitStatus::Ready {
            return (status, Vec::new());
        }
        let status = output.wait_for_arcs(usize::MAX, Some(Duration::from_secs(5)));
        let arcs = output.lock().iter().copied().collect();
        output.consumer_end_utterance();
        (status, arcs)
    })
}

pub async fn next_utterance(rx: &mut broadcast::Receiver<UtteranceEvent>) -> UtteranceEvent {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => panic!("utterance channel failed: {e}"),
        Err(_) => panic!("timed out waiting for an utterance event"),
    }
}
