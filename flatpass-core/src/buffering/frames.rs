//! Acoustic frame channel.
//!
//! The acoustic stage scores frames and sends them over a bounded crossbeam
//! channel; [`FrameConsumer`] buffers them by index and implements
//! [`AcousticModel`] for the search. Dropping the producer before the
//! utterance ends is treated as cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{trace, warn};

use crate::buffering::WaitStatus;
use crate::error::{Result, SearchError};
use crate::logmath::Score;
use crate::model::{AcousticModel, FrameIdx};

#[derive(Debug)]
enum FrameMessage {
    Start,
    Frame(Arc<[Score]>),
    End,
}

/// Create a connected producer/consumer pair holding at most `capacity`
/// in-flight messages.
pub fn frame_channel(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = bounded(capacity);
    (
        FrameProducer { tx },
        FrameConsumer {
            rx,
            frames: VecDeque::new(),
            base: 0,
            received: 0,
            eou: false,
            pending_start: false,
        },
    )
}

/// Sending half, owned by the acoustic stage.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    tx: Sender<FrameMessage>,
}

impl FrameProducer {
    pub fn start_utterance(&self) -> Result<()> {
        self.send(FrameMessage::Start)
    }

    /// Send one frame of senone scores. Blocks while the channel is full.
    pub fn push_frame(&self, scores: impl Into<Arc<[Score]>>) -> Result<()> {
        self.send(FrameMessage::Frame(scores.into()))
    }

    pub fn end_utterance(&self) -> Result<()> {
        self.send(FrameMessage::End)
    }

    fn send(&self, msg: FrameMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| SearchError::Cancelled)
    }
}

/// Receiving half; frames are addressed by their index within the utterance.
#[derive(Debug)]
pub struct FrameConsumer {
    rx: Receiver<FrameMessage>,
    /// Frames `base..received` not yet released.
    frames: VecDeque<Arc<[Score]>>,
    base: FrameIdx,
    received: usize,
    eou: bool,
    /// A `Start` for the next utterance arrived before this one was closed.
    pending_start: bool,
}

impl FrameConsumer {
    /// Number of frames received so far in this utterance.
    pub fn frames_received(&self) -> usize {
        self.received
    }

    fn recv(&self, deadline: Option<Instant>) -> std::result::Result<FrameMessage, WaitStatus> {
        match deadline {
            None => self.rx.recv().map_err(|_| WaitStatus::Cancelled),
            Some(d) if d <= Instant::now() => self.rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => WaitStatus::TimedOut,
                TryRecvError::Disconnected => WaitStatus::Cancelled,
            }),
            Some(d) => self.rx.recv_deadline(d).map_err(|e| match e {
                RecvTimeoutError::Timeout => WaitStatus::TimedOut,
                RecvTimeoutError::Disconnected => WaitStatus::Cancelled,
            }),
        }
    }
}

impl AcousticModel for FrameConsumer {
    fn start_utterance(&mut self, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.pending_start {
            match self.recv(deadline) {
                Ok(FrameMessage::Start) => break,
                Ok(other) => warn!(?other, "frame message outside an utterance dropped"),
                Err(status) => return status,
            }
        }
        self.pending_start = false;
        self.eou = false;
        WaitStatus::Ready
    }

    fn wait_for_frame(&mut self, frame: FrameIdx, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.received <= frame {
            if self.eou {
                return WaitStatus::EndOfUtterance;
            }
            match self.recv(deadline) {
                Ok(FrameMessage::Frame(scores)) => {
                    trace!(frame = self.received, "frame received");
                    self.frames.push_back(scores);
                    self.received += 1;
                }
                Ok(FrameMessage::End) => self.eou = true,
                Ok(FrameMessage::Start) => {
                    warn!("utterance start before end; closing current utterance");
                    self.pending_start = true;
                    self.eou = true;
                }
                Err(status) => return status,
            }
        }
        WaitStatus::Ready
    }

    fn score_frame(&mut self, frame: FrameIdx) -> Option<Arc<[Score]>> {
        frame
            .checked_sub(self.base)
            .and_then(|i| self.frames.get(i))
            .cloned()
    }

    fn is_end_of_utterance(&self) -> bool {
        self.eou
    }

    fn release_frame(&mut self, frame: FrameIdx) {
        while self.base <= frame && !self.frames.is_empty() {
            self.frames.pop_front();
            self.base += 1;
        }
    }

    fn end_utterance(&mut self) {
        self.frames.clear();
        self.base = 0;
        self.received = 0;
        self.eou = false;
    }
}
