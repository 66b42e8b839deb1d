//! `SearchEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SearchEngine::new()       → models validated, search built, status = Idle
//!     └─► start()           → worker spawned, status = Decoding
//!         └─► stop()        → run flag cleared, input shut down, status = Stopped
//! ```
//!
//! `start()`/`stop()` called in the wrong state return an error rather than
//! panicking. A stopped engine can be started again with fresh buffers; the
//! input buffer of a stopped run stays shut down.
//!
//! Every run gets its own running flag and diagnostics. A worker that is
//! still winding down after `stop()` only ever sees its own, already cleared
//! flag, so it cannot end or report on a later run. Run flags change only
//! under the status lock.
//!
//! ## Threading
//!
//! The search itself is single-threaded and blocking. The worker runs inside
//! `spawn_blocking`, owning the per-utterance state; only the arc buffers and
//! the acoustic channel are shared with other stages.

pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    buffering::ArcBuffer,
    error::{Result, SearchError},
    events::{SearchStatus, SearchStatusEvent, UtteranceEvent},
    model::AcousticModel,
    search::{FlatSearch, SearchModels},
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Tuning for the flat-lexicon pass.
///
/// Probabilities are linear; they are converted to the integer log domain
/// once, when the search is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    /// Base of the integer log domain. Default: 1.0001.
    pub log_base: f64,
    /// Phone beam as a probability ratio to the frame best. Default: 1e-64.
    pub beam: f64,
    /// Word-exit beam. Default: 7e-29.
    pub word_beam: f64,
    /// Scale applied to LM scores in this pass. Default: 1.0.
    pub lm_weight: f64,
    /// Penalty on every in-word phone transition. Default: 1.0 (none).
    pub phone_insertion_prob: f64,
    /// Penalty on every word transition. Default: 0.65.
    pub word_insertion_prob: f64,
    /// Silence penalty, used in place of an LM score. Default: 0.005.
    pub silence_prob: f64,
    /// Filler penalty, used in place of an LM score. Default: 1e-8.
    pub filler_prob: f64,
    /// Arc window half-width in frames. Default: 25.
    pub lookahead_window: usize,
    /// Bounded acoustic wait while upstream arcs are still arriving.
    /// Default: 20 ms.
    pub acoustic_timeout_ms: u64,
    /// Wait for upstream arcs; `None` waits until they arrive or the input
    /// is shut down. Default: `None`.
    pub arc_timeout_ms: Option<u64>,
    /// Optional `<dictionary-word> <upstream-word>` map file.
    pub vocab_map: Option<PathBuf>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            log_base: 1.0001,
            beam: 1e-64,
            word_beam: 7e-29,
            lm_weight: 1.0,
            phone_insertion_prob: 1.0,
            word_insertion_prob: 0.65,
            silence_prob: 0.005,
            filler_prob: 1e-8,
            lookahead_window: 25,
            acoustic_timeout_ms: 20,
            arc_timeout_ms: None,
            vocab_map: None,
        }
    }
}

impl SearchConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.log_base.is_finite() && self.log_base > 1.0) {
            return Err(SearchError::InvalidConfig(format!(
                "logBase must be greater than 1, got {}",
                self.log_base
            )));
        }
        let probs = [
            ("beam", self.beam),
            ("wordBeam", self.word_beam),
            ("phoneInsertionProb", self.phone_insertion_prob),
            ("wordInsertionProb", self.word_insertion_prob),
            ("silenceProb", self.silence_prob),
            ("fillerProb", self.filler_prob),
        ];
        for (name, p) in probs {
            if !(p > 0.0 && p <= 1.0) {
                return Err(SearchError::InvalidConfig(format!(
                    "{name} must be a probability in (0, 1], got {p}"
                )));
            }
        }
        if !(self.lm_weight.is_finite() && self.lm_weight > 0.0) {
            return Err(SearchError::InvalidConfig(format!(
                "lmWeight must be positive, got {}",
                self.lm_weight
            )));
        }
        if self.lookahead_window == 0 {
            return Err(SearchError::InvalidConfig(
                "lookaheadWindow must be at least one frame".into(),
            ));
        }
        Ok(())
    }

    pub fn acoustic_timeout(&self) -> Duration {
        Duration::from_millis(self.acoustic_timeout_ms)
    }

    pub fn arc_timeout(&self) -> Option<Duration> {
        self.arc_timeout_ms.map(Duration::from_millis)
    }
}

/// The top-level engine handle.
///
/// `SearchEngine` is `Send + Sync`; all fields use interior mutability.
pub struct SearchEngine {
    config: SearchConfig,
    search: Arc<FlatSearch>,
    /// Flag of the latest run, `true` while its worker is decoding. Locked
    /// after `status` when both are held.
    running: Mutex<Arc<AtomicBool>>,
    status: Arc<Mutex<SearchStatus>>,
    utterance_tx: broadcast::Sender<UtteranceEvent>,
    status_tx: broadcast::Sender<SearchStatusEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    /// Counters of the latest run.
    diagnostics: Mutex<Arc<pipeline::SearchDiagnostics>>,
    /// Input of the current run, shut down by `stop()`.
    input: Mutex<Option<Arc<ArcBuffer>>>,
}

impl SearchEngine {
    /// Validate the models and build the search. No engine exists after a
    /// setup error.
    pub fn new(config: SearchConfig, models: SearchModels) -> Result<Self> {
        let search = Arc::new(FlatSearch::new(&config, models)?);
        let (utterance_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            search,
            running: Mutex::new(Arc::new(AtomicBool::new(false))),
            status: Arc::new(Mutex::new(SearchStatus::Idle)),
            utterance_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Mutex::new(Arc::new(pipeline::SearchDiagnostics::default())),
            input: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Spawn the worker, which decodes utterances from `input` and `acoustic`
    /// back to back, forwarding word exits to `output`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - `SearchError::AlreadyRunning` if already started.
    /// - `SearchError::Other` when no runtime is available.
    pub fn start(
        &self,
        acoustic: impl AcousticModel,
        input: Arc<ArcBuffer>,
        output: Arc<ArcBuffer>,
    ) -> Result<()> {
        let mut status = self.status.lock();
        let mut running = self.running.lock();
        if running.load(Ordering::SeqCst) {
            return Err(SearchError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SearchError::Other(anyhow::anyhow!("no tokio runtime: {e}")))?;

        let run_flag = Arc::new(AtomicBool::new(true));
        *running = Arc::clone(&run_flag);
        drop(running);
        let diagnostics = Arc::new(pipeline::SearchDiagnostics::default());
        *self.diagnostics.lock() = Arc::clone(&diagnostics);
        *self.input.lock() = Some(Arc::clone(&input));
        self.publish(&mut status, SearchStatus::Decoding, None);
        drop(status);

        let ctx = pipeline::PipelineContext {
            config: self.config.clone(),
            search: Arc::clone(&self.search),
            acoustic: Box::new(acoustic),
            input,
            output,
            running: run_flag,
            utterance_tx: self.utterance_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            diagnostics,
        };
        runtime.spawn_blocking(move || pipeline::run(ctx));

        info!(
            window = self.config.lookahead_window,
            "search engine started"
        );
        Ok(())
    }

    /// Stop the worker. A wait blocked on the input returns immediately.
    ///
    /// # Errors
    /// - `SearchError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let mut status = self.status.lock();
        if !self.running.lock().swap(false, Ordering::SeqCst) {
            return Err(SearchError::NotRunning);
        }

        if let Some(input) = self.input.lock().take() {
            input.shutdown();
        }
        self.publish(&mut status, SearchStatus::Stopped, None);
        info!("search engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().load(Ordering::SeqCst)
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> SearchStatus {
        *self.status.lock()
    }

    /// Subscribe to finished-utterance events.
    pub fn subscribe_utterances(&self) -> broadcast::Receiver<UtteranceEvent> {
        self.utterance_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SearchStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of worker counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.lock().snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn publish(&self, slot: &mut SearchStatus, new_status: SearchStatus, detail: Option<String>) {
        *slot = new_status;
        let _ = self.status_tx.send(SearchStatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_json_fields() {
        let config =
            SearchConfig::from_json_str(r#"{"beam": 1e-40, "arcTimeoutMs": 500}"#).expect("parse");
        assert_eq!(config.beam, 1e-40);
        assert_eq!(config.arc_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.word_insertion_prob, 0.65);
        assert_eq!(config.lookahead_window, 25);
        assert!(config.vocab_map.is_none());
    }

    #[test]
    fn config_serializes_camel_case() {
        let json = serde_json::to_value(SearchConfig::default()).expect("serialize");
        assert_eq!(json["lookaheadWindow"], 25);
        assert_eq!(json["acousticTimeoutMs"], 20);
        assert!(json["arcTimeoutMs"].is_null());
    }

    #[test]
    fn config_rejects_out_of_range_probabilities() {
        for json in [
            r#"{"beam": 0.0}"#,
            r#"{"wordBeam": 1.5}"#,
            r#"{"silenceProb": -0.1}"#,
            r#"{"lookaheadWindow": 0}"#,
            r#"{"logBase": 1.0}"#,
        ] {
            let err = SearchConfig::from_json_str(json);
            assert!(
                matches!(err, Err(SearchError::InvalidConfig(_))),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn config_reports_malformed_json() {
        let err = SearchConfig::from_json_str("{ not json");
        assert!(matches!(err, Err(SearchError::Config(_))));
    }

    #[test]
    fn engine_is_not_built_after_setup_failure() {
        let config = SearchConfig {
            lookahead_window: 0,
            ..SearchConfig::default()
        };
        let err = SearchEngine::new(config, crate::search::fixtures::scenario_models()).err();
        assert!(matches!(err, Some(SearchError::InvalidConfig(_))));
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let engine = SearchEngine::new(
            crate::search::fixtures::config(),
            crate::search::fixtures::scenario_models(),
        )
        .expect("engine");
        assert_eq!(engine.status(), SearchStatus::Idle);
        assert!(matches!(engine.stop(), Err(SearchError::NotRunning)));
    }
}
