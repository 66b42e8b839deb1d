//! Blocking search driver.
//!
//! ## Per utterance
//!
//! ```text
//! 1. Wait for the input arcs and the acoustic stage to start an utterance
//! 2. Seed the search (start word, special chains), start the output
//! 3. Per frame, a small state machine:
//!      WaitingForArcs      arcs up to frame + window, or input final
//!      WaitingForAcoustic  the frame's senone scores, or acoustic end
//!      Evaluating          copy the arc window, search one frame,
//!                          release arcs no later frame can use
//!      Finishing           finalize, flush output, emit UtteranceEvent
//! ```
//!
//! Arc waits use `arcTimeoutMs` (unbounded by default). Acoustic waits are
//! bounded by `acousticTimeoutMs` while arcs are still arriving, so the
//! driver keeps draining arcs, and unbounded once the input is final. Every
//! unbounded wait is sliced so a cleared running flag is noticed promptly.
//!
//! A shut-down input or acoustic channel cancels the utterance: the output is
//! shut down too, so downstream waiters never block forever.
//!
//! This entire loop runs in `spawn_blocking`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffering::{ArcBuffer, WaitStatus, WordArc},
    engine::SearchConfig,
    error::{Result, SearchError},
    events::{SearchStatus, SearchStatusEvent, UtteranceEvent},
    model::AcousticModel,
    search::{FlatSearch, FrameStatus, UtteranceOutcome},
};

/// Longest single blocking wait before the running flag is re-checked.
const WAIT_SLICE: Duration = Duration::from_millis(50);

pub struct SearchDiagnostics {
    pub utterances: AtomicUsize,
    pub frames_searched: AtomicUsize,
    pub failed_searches: AtomicUsize,
    pub cancellations: AtomicUsize,
    pub arcs_expanded: AtomicUsize,
    pub entries_forwarded: AtomicUsize,
    pub renormalizations: AtomicUsize,
    pub arc_wait_timeouts: AtomicUsize,
    pub acoustic_wait_timeouts: AtomicUsize,
}

impl Default for SearchDiagnostics {
    fn default() -> Self {
        Self {
            utterances: AtomicUsize::new(0),
            frames_searched: AtomicUsize::new(0),
            failed_searches: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            arcs_expanded: AtomicUsize::new(0),
            entries_forwarded: AtomicUsize::new(0),
            renormalizations: AtomicUsize::new(0),
            arc_wait_timeouts: AtomicUsize::new(0),
            acoustic_wait_timeouts: AtomicUsize::new(0),
        }
    }
}

impl SearchDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            utterances: self.utterances.load(Ordering::Relaxed),
            frames_searched: self.frames_searched.load(Ordering::Relaxed),
            failed_searches: self.failed_searches.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            arcs_expanded: self.arcs_expanded.load(Ordering::Relaxed),
            entries_forwarded: self.entries_forwarded.load(Ordering::Relaxed),
            renormalizations: self.renormalizations.load(Ordering::Relaxed),
            arc_wait_timeouts: self.arc_wait_timeouts.load(Ordering::Relaxed),
            acoustic_wait_timeouts: self.acoustic_wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub utterances: usize,
    pub frames_searched: usize,
    pub failed_searches: usize,
    pub cancellations: usize,
    pub arcs_expanded: usize,
    pub entries_forwarded: usize,
    pub renormalizations: usize,
    pub arc_wait_timeouts: usize,
    pub acoustic_wait_timeouts: usize,
}

/// All context the worker needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: SearchConfig,
    pub search: Arc<FlatSearch>,
    pub acoustic: Box<dyn AcousticModel>,
    pub input: Arc<ArcBuffer>,
    pub output: Arc<ArcBuffer>,
    /// Running flag of this run only. Cleared under the `status` lock.
    pub running: Arc<AtomicBool>,
    pub utterance_tx: broadcast::Sender<UtteranceEvent>,
    pub status_tx: broadcast::Sender<SearchStatusEvent>,
    pub status: Arc<Mutex<SearchStatus>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<SearchDiagnostics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    WaitingForArcs,
    WaitingForAcoustic,
    Evaluating,
    Finishing,
}

/// Decode utterances until `ctx.running` becomes false or a channel is shut
/// down.
pub fn run(mut ctx: PipelineContext) {
    info!("search worker started");
    let mut index = 0u64;

    while ctx.running.load(Ordering::Relaxed) {
        let span = info_span!("utterance", utterance = index);
        let _enter = span.enter();

        match decode_utterance(&mut ctx) {
            Ok(outcome) => {
                emit_utterance(&ctx, index, outcome);
                index += 1;
            }
            Err(e) if e.is_cancelled() => {
                let mut status = ctx.status.lock();
                if ctx.running.swap(false, Ordering::SeqCst) {
                    warn!("input shut down mid-decode, search cancelled");
                    ctx.diagnostics.cancellations.fetch_add(1, Ordering::Relaxed);
                    publish(&ctx, &mut status, SearchStatus::Cancelled, None);
                } else {
                    debug!("worker stop observed");
                }
                break;
            }
            Err(e) => {
                error!("search failed: {e}");
                ctx.output.shutdown();
                let mut status = ctx.status.lock();
                if ctx.running.swap(false, Ordering::SeqCst) {
                    publish(&ctx, &mut status, SearchStatus::Error, Some(e.to_string()));
                }
                break;
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        utterances = snap.utterances,
        frames_searched = snap.frames_searched,
        failed_searches = snap.failed_searches,
        cancellations = snap.cancellations,
        arcs_expanded = snap.arcs_expanded,
        entries_forwarded = snap.entries_forwarded,
        renormalizations = snap.renormalizations,
        arc_wait_timeouts = snap.arc_wait_timeouts,
        acoustic_wait_timeouts = snap.acoustic_wait_timeouts,
        "search worker stopped"
    );
}

/// Decode one utterance. On cancellation the output is shut down before
/// returning `SearchError::Cancelled`.
pub fn decode_utterance(ctx: &mut PipelineContext) -> Result<UtteranceOutcome> {
    let result = drive_utterance(ctx);
    if matches!(result, Err(SearchError::Cancelled)) {
        ctx.output.shutdown();
        ctx.acoustic.end_utterance();
    }
    result
}

fn drive_utterance(ctx: &mut PipelineContext) -> Result<UtteranceOutcome> {
    let running = Arc::clone(&ctx.running);
    let search = Arc::clone(&ctx.search);
    let window = search.window();

    expect_ready(wait_sliced(&running, None, |t| ctx.input.wait_for_start(t)))?;
    expect_ready(wait_sliced(&running, None, |t| {
        ctx.acoustic.start_utterance(t)
    }))?;

    let mut utt = search.start_utterance(&ctx.output);
    let mut state = DriverState::WaitingForArcs;
    debug!("utterance started");

    loop {
        let frame = utt.frame();
        state = match state {
            DriverState::WaitingForArcs => {
                let status = wait_sliced(&running, ctx.config.arc_timeout(), |t| {
                    ctx.input.wait_for_arcs(frame + window, t)
                });
                match status {
                    WaitStatus::Ready | WaitStatus::EndOfUtterance => {}
                    WaitStatus::TimedOut => {
                        ctx.diagnostics
                            .arc_wait_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(frame, "arc wait timed out, searching with arcs so far");
                    }
                    WaitStatus::Cancelled => return Err(SearchError::Cancelled),
                }
                DriverState::WaitingForAcoustic
            }

            DriverState::WaitingForAcoustic => {
                let timeout = if ctx.input.is_end_of_utterance() {
                    None
                } else {
                    Some(ctx.config.acoustic_timeout())
                };
                let acoustic = &mut ctx.acoustic;
                match wait_sliced(&running, timeout, |t| acoustic.wait_for_frame(frame, t)) {
                    WaitStatus::Ready => DriverState::Evaluating,
                    WaitStatus::EndOfUtterance => DriverState::Finishing,
                    WaitStatus::TimedOut => {
                        ctx.diagnostics
                            .acoustic_wait_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        DriverState::WaitingForArcs
                    }
                    WaitStatus::Cancelled => return Err(SearchError::Cancelled),
                }
            }

            DriverState::Evaluating => {
                let from = frame.saturating_sub(window);
                let arcs: Vec<WordArc> = ctx
                    .input
                    .lock()
                    .window(from, frame + window)
                    .copied()
                    .collect();
                ctx.diagnostics
                    .arcs_expanded
                    .fetch_add(arcs.len(), Ordering::Relaxed);
                search.expand_arcs(&mut utt, &arcs);

                let status = search.search_frame(&mut utt, &mut *ctx.acoustic, &ctx.output)?;
                ctx.input
                    .lock()
                    .release_up_to((frame + 1).saturating_sub(window));

                match status {
                    FrameStatus::Searched => DriverState::WaitingForArcs,
                    FrameStatus::Failed => {
                        ctx.diagnostics
                            .failed_searches
                            .fetch_add(1, Ordering::Relaxed);
                        DriverState::Finishing
                    }
                }
            }

            DriverState::Finishing => {
                ctx.input.consumer_end_utterance();
                return Ok(search.finish_utterance(&mut utt, &mut *ctx.acoustic, &ctx.output));
            }
        };
    }
}

/// Call `wait` with timeouts of at most [`WAIT_SLICE`] until it returns
/// something other than `TimedOut`, `timeout` elapses, or `running` is
/// cleared (reported as `Cancelled`).
fn wait_sliced(
    running: &AtomicBool,
    timeout: Option<Duration>,
    mut wait: impl FnMut(Option<Duration>) -> WaitStatus,
) -> WaitStatus {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if !running.load(Ordering::Relaxed) {
            return WaitStatus::Cancelled;
        }
        let slice = deadline.map_or(WAIT_SLICE, |d| {
            d.saturating_duration_since(Instant::now()).min(WAIT_SLICE)
        });
        match wait(Some(slice)) {
            WaitStatus::TimedOut if deadline.map_or(true, |d| Instant::now() < d) => {}
            status => return status,
        }
    }
}

fn expect_ready(status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Ready => Ok(()),
        WaitStatus::Cancelled => Err(SearchError::Cancelled),
        other => Err(SearchError::Other(anyhow::anyhow!(
            "utterance start wait ended with {other:?}"
        ))),
    }
}

fn emit_utterance(ctx: &PipelineContext, index: u64, outcome: UtteranceOutcome) {
    let stats = &outcome.stats;
    let d = &ctx.diagnostics;
    d.utterances.fetch_add(1, Ordering::Relaxed);
    d.frames_searched.fetch_add(stats.frames, Ordering::Relaxed);
    d.entries_forwarded.fetch_add(stats.entries, Ordering::Relaxed);
    d.renormalizations
        .fetch_add(stats.renormalizations, Ordering::Relaxed);

    info!(
        words = %outcome.words.join(" "),
        frames = stats.frames,
        path_score = ?outcome.path_score,
        "hypothesis"
    );
    let event = UtteranceEvent {
        seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
        utterance: index,
        frames: stats.frames,
        entries: stats.entries,
        path_score: outcome.path_score,
        words: outcome.words,
        segments: outcome.segments,
    };
    let _ = ctx.utterance_tx.send(event);
}

/// Report how this run ended. `slot` is the held status lock.
fn publish(
    ctx: &PipelineContext,
    slot: &mut SearchStatus,
    status: SearchStatus,
    detail: Option<String>,
) {
    *slot = status;
    let _ = ctx.status_tx.send(SearchStatusEvent { status, detail });
}
