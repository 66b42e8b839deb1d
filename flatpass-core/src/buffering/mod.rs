//! Inter-stage buffers.
//!
//! Word arcs travel between search passes through an [`ArcBuffer`]: a
//! lockable, frame-ordered queue with blocking waits. A buffer built
//! [`with_capacity`](ArcBuffer::with_capacity) makes its producer wait while
//! full, unless the consumer is itself waiting for arcs: the consumer can
//! only release arcs after advancing, so the bound yields rather than
//! deadlock a lookahead window wider than the capacity. Acoustic frames come
//! from the scoring stage over a bounded crossbeam channel ([`frames`]).
//!
//! ```text
//! upstream pass ──ArcBuffer──► flat search ──ArcBuffer──► lattice builder
//!                                  ▲
//! acoustic stage ──frame_channel───┘
//! ```

pub mod arc;
pub mod frames;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

pub use arc::WordArc;
pub use frames::{frame_channel, FrameConsumer, FrameProducer};

use crate::model::FrameIdx;

/// Result of a blocking wait on a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited data is available.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The producer finished the utterance; the data will never arrive.
    EndOfUtterance,
    /// The buffer was shut down.
    Cancelled,
}

#[derive(Debug, Default)]
struct ArcState {
    /// Sorted by start frame.
    arcs: VecDeque<WordArc>,
    /// Every arc starting before this frame has been pushed.
    next_sf: FrameIdx,
    started: bool,
    final_: bool,
    consumer_done: bool,
    /// The consumer is blocked in `wait_for_arcs`.
    starving: bool,
    shutdown: bool,
}

/// Frame-ordered arc queue shared by one producer and one consumer.
#[derive(Debug)]
pub struct ArcBuffer {
    name: String,
    /// Arcs held before `push` waits; `None` is unbounded.
    capacity: Option<usize>,
    state: Mutex<ArcState>,
    cond: Condvar,
}

impl ArcBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            state: Mutex::new(ArcState::default()),
            cond: Condvar::new(),
        }
    }

    /// A buffer whose producer waits while `capacity` arcs are held.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Producer side ────────────────────────────────────────────────────────

    /// Begin a new utterance, discarding anything left from the previous one.
    pub fn start_utterance(&self) {
        let mut st = self.state.lock();
        st.arcs.clear();
        st.next_sf = 0;
        st.started = true;
        st.final_ = false;
        st.consumer_done = false;
        st.starving = false;
        debug!(buffer = %self.name, "producer start");
        self.cond.notify_all();
    }

    /// Append arcs and advance the completeness frontier to `next_sf`.
    ///
    /// On a bounded buffer, first waits until there is room, the consumer is
    /// waiting for arcs, or the buffer is shut down. A batch may overshoot
    /// the capacity.
    pub fn push(&self, arcs: impl IntoIterator<Item = WordArc>, next_sf: FrameIdx) {
        let mut st = self.state.lock();
        if let Some(cap) = self.capacity {
            if st.arcs.len() >= cap {
                debug!(buffer = %self.name, held = st.arcs.len(), "producer waiting for room");
            }
            while st.arcs.len() >= cap && !st.starving && !st.consumer_done && !st.shutdown {
                self.cond.wait(&mut st);
            }
        }
        for arc in arcs {
            let at = st.arcs.partition_point(|a| a.start_frame <= arc.start_frame);
            st.arcs.insert(at, arc);
        }
        st.next_sf = st.next_sf.max(next_sf);
        self.cond.notify_all();
    }

    /// Mark the utterance complete. With `wait_for_consumer`, block until the
    /// consumer has finished with it (or the buffer is shut down).
    pub fn end_utterance(&self, wait_for_consumer: bool) {
        let mut st = self.state.lock();
        st.final_ = true;
        self.cond.notify_all();
        debug!(buffer = %self.name, arcs = st.arcs.len(), "producer end");
        while wait_for_consumer && !st.consumer_done && !st.shutdown {
            self.cond.wait(&mut st);
        }
    }

    /// Wake every waiter and make all further waits return `Cancelled`.
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown = true;
        debug!(buffer = %self.name, "shutdown");
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    // ── Consumer side ────────────────────────────────────────────────────────

    /// Wait for the producer to start an utterance.
    pub fn wait_for_start(&self, timeout: Option<Duration>) -> WaitStatus {
        self.wait_until(timeout, |st| st.started.then_some(WaitStatus::Ready))
    }

    /// Wait until every arc starting before `until_sf` is present, or the
    /// utterance is final.
    pub fn wait_for_arcs(&self, until_sf: FrameIdx, timeout: Option<Duration>) -> WaitStatus {
        let status = self.wait_until(timeout, |st| {
            if st.next_sf >= until_sf {
                Some(WaitStatus::Ready)
            } else if st.final_ {
                Some(WaitStatus::EndOfUtterance)
            } else {
                if !st.starving {
                    st.starving = true;
                    self.cond.notify_all();
                }
                None
            }
        });
        self.state.lock().starving = false;
        status
    }

    pub fn is_end_of_utterance(&self) -> bool {
        self.state.lock().final_
    }

    /// Lock the buffer for reading or releasing arcs.
    pub fn lock(&self) -> ArcBufferGuard<'_> {
        ArcBufferGuard {
            state: self.state.lock(),
            cond: &self.cond,
        }
    }

    /// The consumer is done with this utterance.
    pub fn consumer_end_utterance(&self) {
        let mut st = self.state.lock();
        st.arcs.clear();
        st.started = false;
        st.consumer_done = true;
        debug!(buffer = %self.name, "consumer end");
        self.cond.notify_all();
    }

    fn wait_until<F>(&self, timeout: Option<Duration>, mut ready: F) -> WaitStatus
    where
        F: FnMut(&mut ArcState) -> Option<WaitStatus>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock();
        loop {
            if st.shutdown {
                return WaitStatus::Cancelled;
            }
            if let Some(status) = ready(&mut *st) {
                return status;
            }
            match deadline {
                None => self.cond.wait(&mut st),
                Some(d) => {
                    if self.cond.wait_until(&mut st, d).timed_out() {
                        if st.shutdown {
                            return WaitStatus::Cancelled;
                        }
                        return ready(&mut *st).unwrap_or(WaitStatus::TimedOut);
                    }
                }
            }
        }
    }
}

/// Exclusive access to an [`ArcBuffer`]'s contents.
pub struct ArcBufferGuard<'a> {
    state: MutexGuard<'a, ArcState>,
    cond: &'a Condvar,
}

impl ArcBufferGuard<'_> {
    /// Arcs with `from_sf <= start_frame < to_sf`.
    pub fn window(&self, from_sf: FrameIdx, to_sf: FrameIdx) -> impl Iterator<Item = &WordArc> {
        let start = self.state.arcs.partition_point(|a| a.start_frame < from_sf);
        self.state
            .arcs
            .range(start..)
            .take_while(move |a| a.start_frame < to_sf)
    }

    /// Every arc still held.
    pub fn iter(&self) -> impl Iterator<Item = &WordArc> {
        self.state.arcs.iter()
    }

    /// Drop arcs starting before `sf`, waking a producer waiting for room.
    pub fn release_up_to(&mut self, sf: FrameIdx) {
        let n = self.state.arcs.partition_point(|a| a.start_frame < sf);
        if n > 0 {
            self.state.arcs.drain(..n);
            self.cond.notify_all();
        }
    }

    pub fn next_sf(&self) -> FrameIdx {
        self.state.next_sf
    }

    pub fn is_final(&self) -> bool {
        self.state.final_
    }

    pub fn len(&self) -> usize {
        self.state.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.arcs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn window_and_release_follow_start_frames() {
        let buf = ArcBuffer::new("test");
        buf.start_utterance();
        buf.push(
            [WordArc::hint(2, 5, 9), WordArc::hint(1, 0, 4), WordArc::hint(3, 5, 7)],
            6,
        );
        {
            let guard = buf.lock();
            let words: Vec<_> = guard.window(0, 6).map(|a| a.word).collect();
            assert_eq!(words, vec![1, 2, 3]);
            assert_eq!(guard.window(1, 5).count(), 0);
            assert_eq!(guard.next_sf(), 6);
        }
        buf.lock().release_up_to(5);
        assert_eq!(buf.lock().len(), 2);
    }

    #[test]
    fn wait_reports_end_of_utterance_when_final_without_frontier() {
        let buf = ArcBuffer::new("test");
        buf.start_utterance();
        buf.push([WordArc::hint(1, 0, 3)], 2);
        assert_eq!(buf.wait_for_arcs(2, Some(Duration::ZERO)), WaitStatus::Ready);
        assert_eq!(
            buf.wait_for_arcs(10, Some(Duration::from_millis(5))),
            WaitStatus::TimedOut
        );
        buf.end_utterance(false);
        assert_eq!(buf.wait_for_arcs(10, None), WaitStatus::EndOfUtterance);
    }

    #[test]
    fn shutdown_wakes_a_blocked_consumer() {
        let buf = Arc::new(ArcBuffer::new("test"));
        buf.start_utterance();
        let waiter = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.wait_for_arcs(100, None))
        };
        thread::sleep(Duration::from_millis(20));
        buf.shutdown();
        assert_eq!(waiter.join().expect("waiter"), WaitStatus::Cancelled);
        assert_eq!(buf.wait_for_start(None), WaitStatus::Cancelled);
    }

    #[test]
    fn producer_end_waits_for_consumer() {
        let buf = Arc::new(ArcBuffer::new("test"));
        buf.start_utterance();
        let producer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.end_utterance(true))
        };
        assert_eq!(buf.wait_for_arcs(1, None), WaitStatus::EndOfUtterance);
        buf.consumer_end_utterance();
        producer.join().expect("producer");
        assert_eq!(
            buf.wait_for_start(Some(Duration::from_millis(5))),
            WaitStatus::TimedOut
        );
    }

    fn pusher(buf: &Arc<ArcBuffer>, arc: WordArc, next_sf: FrameIdx) -> thread::JoinHandle<()> {
        let buf = Arc::clone(buf);
        thread::spawn(move || buf.push([arc], next_sf))
    }

    #[test]
    fn full_buffer_holds_the_producer_until_arcs_are_released() {
        let buf = Arc::new(ArcBuffer::with_capacity("test", 2));
        buf.start_utterance();
        buf.push([WordArc::hint(1, 0, 2), WordArc::hint(2, 1, 3)], 2);
        let producer = pusher(&buf, WordArc::hint(3, 2, 4), 3);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(buf.lock().len(), 2, "producer still waiting");
        assert!(!producer.is_finished());

        buf.lock().release_up_to(1);
        producer.join().expect("producer");
        let words: Vec<_> = buf.lock().iter().map(|a| a.word).collect();
        assert_eq!(words, vec![2, 3]);
        assert_eq!(buf.lock().next_sf(), 3);
    }

    #[test]
    fn starving_consumer_lets_a_full_buffer_grow() {
        let buf = Arc::new(ArcBuffer::with_capacity("test", 1));
        buf.start_utterance();
        buf.push([WordArc::hint(1, 0, 2)], 1);
        let producer = pusher(&buf, WordArc::hint(2, 3, 5), 10);

        assert_eq!(
            buf.wait_for_arcs(5, Some(Duration::from_secs(5))),
            WaitStatus::Ready
        );
        producer.join().expect("producer");
        assert_eq!(buf.lock().len(), 2);
    }

    #[test]
    fn shutdown_releases_a_producer_waiting_for_room() {
        let buf = Arc::new(ArcBuffer::with_capacity("test", 1));
        buf.start_utterance();
        buf.push([WordArc::hint(1, 0, 2)], 1);
        let producer = pusher(&buf, WordArc::hint(2, 1, 3), 2);

        thread::sleep(Duration::from_millis(20));
        buf.shutdown();
        producer.join().expect("producer");
        assert!(buf.is_shutdown());
    }
}
