//! # flatpass-core
//!
//! Second-pass flat-lexicon beam search for a pipelined speech decoder.
//!
//! ## Architecture
//!
//! ```text
//! first pass ──ArcBuffer (word hints)──┐
//!                                      ▼
//! acoustic stage ──frame_channel──► SearchEngine worker (spawn_blocking)
//!                                      │  expand arcs → evaluate → prune
//!                                      │  → word transition → backpointers
//!                                      ▼
//!                    ArcBuffer (finalized word exits) ──► lattice builder
//!                                      │
//!                       broadcast::Sender<UtteranceEvent>
//! ```
//!
//! Every word proposed by the first pass gets its own HMM chain for the
//! utterance; the search rescores word transitions with the full n-gram LM
//! and forwards word exits as soon as no live path can still reach them.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod hmm;
pub mod logmath;
pub mod model;
pub mod search;

// Convenience re-exports for downstream crates
pub use buffering::{frame_channel, ArcBuffer, FrameConsumer, FrameProducer, WaitStatus, WordArc};
pub use engine::{SearchConfig, SearchEngine};
pub use error::SearchError;
pub use events::{SearchStatus, SearchStatusEvent, UtteranceEvent};
pub use logmath::{LogMath, Score, WORST_SCORE};
pub use model::{AcousticModel, Dictionary, LanguageModel, PhoneContext};
pub use search::{FlatSearch, SearchModels, Segment, UtteranceOutcome, UtteranceStats};
