// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-consumer queue (component I): jitter correction, batch draining and
//! bounded, sequence-header-preserving overflow.
//!
//! Ownership matches `spec.md` §5: the queue's buffer lives on the consumer
//! task, not the source. The source only holds the non-blocking
//! [`ConsumerSender`] half, so a slow consumer can never stall the publisher
//! — back-pressure is absorbed entirely by head-dropping on this side.

use rtmpkit_core::types::Message;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

/// One event pushed by a [`crate::source::LiveSource`] to an attached
/// consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Media(Message),
    /// The publisher went away; no new media follows until one returns.
    /// Consumers stay attached (`spec.md` §4.H "Unpublish").
    Unpublish,
}

/// Timestamp-discontinuity smoothing policy applied as messages are dumped
/// to the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterAlgorithm {
    /// Pass timestamps through unchanged.
    Off,
    /// Rebase the first timestamp of each contiguous run to zero.
    #[default]
    Zero,
    /// Maintain a running correction: jumps of at most one second are
    /// carried through as-is, larger gaps collapse to a small nominal step.
    Full,
}

#[derive(Debug)]
struct Jitter {
    algorithm: JitterAlgorithm,
    started: bool,
    last_in_ts: i64,
    last_out_ts: i64,
}

const FULL_JITTER_MAX_JUMP_MS: i64 = 1000;
const FULL_JITTER_RESET_STEP_MS: i64 = 10;

impl Jitter {
    const fn new(algorithm: JitterAlgorithm) -> Self {
        Self { algorithm, started: false, last_in_ts: 0, last_out_ts: 0 }
    }

    /// Corrects one message timestamp in place, in wire order.
    fn correct(&mut self, ts: u32) -> u32 {
        match self.algorithm {
            JitterAlgorithm::Off => ts,
            JitterAlgorithm::Zero => {
                let ts = i64::from(ts);
                if !self.started {
                    self.started = true;
                    self.last_in_ts = ts;
                    self.last_out_ts = 0;
                    return 0;
                }
                let delta = (ts - self.last_in_ts).max(0);
                self.last_in_ts = ts;
                self.last_out_ts += delta;
                self.last_out_ts as u32
            },
            JitterAlgorithm::Full => {
                let ts = i64::from(ts);
                if !self.started {
                    self.started = true;
                    self.last_in_ts = ts;
                    self.last_out_ts = ts;
                    return ts as u32;
                }
                let delta = ts - self.last_in_ts;
                self.last_in_ts = ts;
                let applied = if !(0..=FULL_JITTER_MAX_JUMP_MS).contains(&delta) { FULL_JITTER_RESET_STEP_MS } else { delta };
                self.last_out_ts = (self.last_out_ts + applied).max(0);
                self.last_out_ts as u32
            },
        }
    }
}

/// The source-side handle: a non-blocking enqueue into one consumer's queue.
#[derive(Debug, Clone)]
pub struct ConsumerSender {
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ConsumerSender {
    /// Pushes one event. Never blocks; a closed receiver (consumer task
    /// gone) is reported back so the source can drop this sender.
    pub fn push(&self, event: ConsumerEvent) -> Result<(), ()> {
        self.tx.send(event).map_err(|_| ())
    }
}

/// Creates one consumer channel: the source-facing [`ConsumerSender`] and
/// the connection-facing [`ConsumerQueue`].
#[must_use]
pub fn channel(max_queue_ms: i64, jitter: JitterAlgorithm) -> (ConsumerSender, ConsumerQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConsumerSender { tx }, ConsumerQueue::new(rx, max_queue_ms, jitter))
}

/// The connection-facing consumer queue (`spec.md` §4.I).
pub struct ConsumerQueue {
    rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    buf: VecDeque<Message>,
    max_queue_ms: i64,
    jitter: Jitter,
    paused: bool,
    unpublished: bool,
    id: u64,
}

impl ConsumerQueue {
    fn new(rx: mpsc::UnboundedReceiver<ConsumerEvent>, max_queue_ms: i64, jitter: JitterAlgorithm) -> Self {
        Self { rx, buf: VecDeque::new(), max_queue_ms, jitter: Jitter::new(jitter), paused: false, unpublished: false, id: 0 }
    }

    /// Set once by the source actor right after `handle_attach` creates this
    /// queue, so the connection can later ask to be detached by id.
    pub(crate) fn set_consumer_id(&mut self, id: u64) {
        self.id = id;
    }

    #[must_use]
    pub const fn consumer_id(&self) -> u64 {
        self.id
    }

    /// Drains whatever the source has already enqueued, without blocking.
    fn drain_available(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                ConsumerEvent::Media(msg) => {
                    self.buf.push_back(msg);
                    self.enforce_overflow();
                },
                ConsumerEvent::Unpublish => self.unpublished = true,
            }
        }
    }

    /// Drops oldest non-sequence-header frames until the buffered span is
    /// within `max_queue_ms`. Sequence headers are never dropped; if every
    /// remaining frame is a sequence header, overflow is left unresolved
    /// rather than violate that guarantee.
    fn enforce_overflow(&mut self) {
        if self.max_queue_ms <= 0 || self.buf.len() < 2 {
            return;
        }
        loop {
            let Some(front) = self.buf.front() else { break };
            let Some(back) = self.buf.back() else { break };
            let span_ms = i64::from(back.timestamp_ms) - i64::from(front.timestamp_ms);
            if span_ms <= self.max_queue_ms {
                break;
            }
            // Never consider the newest frame a drop candidate: overflow
            // sheds backlog, not the live edge.
            let droppable_prefix = self.buf.len().saturating_sub(1);
            let Some(drop_at) = self.buf.iter().take(droppable_prefix).position(|m| !m.is_video_sequence_header() && !m.is_audio_sequence_header())
            else {
                break;
            };
            self.buf.remove(drop_at);
        }
    }

    /// Returns up to `max_count` messages (`0` = no cap), jitter-corrected
    /// in wire order. Empty while paused.
    pub fn dump_packets(&mut self, max_count: usize) -> Vec<Message> {
        self.drain_available();
        if self.paused {
            return Vec::new();
        }
        let take = if max_count == 0 { self.buf.len() } else { max_count.min(self.buf.len()) };
        let mut out = Vec::with_capacity(take);
        for mut msg in self.buf.drain(..take) {
            msg.timestamp_ms = self.jitter.correct(msg.timestamp_ms);
            out.push(msg);
        }
        out
    }

    /// Suspends until at least `min_msgs` are buffered or `min_duration`
    /// elapses, whichever comes first; returns early if the channel closes
    /// (source actor gone) or the publisher unpublished.
    pub async fn wait(&mut self, min_msgs: usize, min_duration: Duration) {
        self.drain_available();
        if self.buf.len() >= min_msgs || self.unpublished {
            return;
        }
        let deadline = tokio::time::sleep(min_duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => return,
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(ConsumerEvent::Media(msg)) => {
                            self.buf.push_back(msg);
                            self.enforce_overflow();
                            if self.buf.len() >= min_msgs {
                                return;
                            }
                        },
                        Some(ConsumerEvent::Unpublish) => {
                            self.unpublished = true;
                            return;
                        },
                        None => return,
                    }
                },
            }
        }
    }

    /// Toggles delivery; while paused, `dump_packets` keeps draining (so
    /// overflow policy still applies) but always returns empty.
    pub fn on_play_client_pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the publisher has gone away since the last drain.
    #[must_use]
    pub const fn is_unpublished(&self) -> bool {
        self.unpublished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtmpkit_core::types::MessageType;

    fn video(ts: u32) -> Message {
        Message::new(MessageType::Video, ts, 1, Bytes::from_static(&[0x27, 1, 0, 0, 0]))
    }

    #[tokio::test]
    async fn test_dump_packets_respects_max_count() {
        let (tx, mut rx) = channel(10_000, JitterAlgorithm::Off);
        for ts in [0, 10, 20] {
            tx.push(ConsumerEvent::Media(video(ts))).unwrap();
        }
        let batch = rx.dump_packets(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(rx.dump_packets(0).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_jitter_rebases_first_timestamp() {
        let (tx, mut rx) = channel(10_000, JitterAlgorithm::Zero);
        tx.push(ConsumerEvent::Media(video(1000))).unwrap();
        tx.push(ConsumerEvent::Media(video(1016))).unwrap();
        let batch = rx.dump_packets(0);
        assert_eq!(batch[0].timestamp_ms, 0);
        assert_eq!(batch[1].timestamp_ms, 16);
    }

    #[tokio::test]
    async fn test_full_jitter_absorbs_small_jump_and_resets_large_gap() {
        let (tx, mut rx) = channel(10_000, JitterAlgorithm::Full);
        tx.push(ConsumerEvent::Media(video(1000))).unwrap();
        tx.push(ConsumerEvent::Media(video(1040))).unwrap();
        tx.push(ConsumerEvent::Media(video(50_000))).unwrap();
        let batch = rx.dump_packets(0);
        assert_eq!(batch[0].timestamp_ms, 1000);
        assert_eq!(batch[1].timestamp_ms, 1040);
        assert_eq!(batch[2].timestamp_ms, 1050);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_but_preserves_sequence_header() {
        let (tx, mut rx) = channel(50, JitterAlgorithm::Off);
        let sh = Message::new(MessageType::Video, 0, 1, Bytes::from_static(&[0x17, 0, 0, 0, 0]));
        tx.push(ConsumerEvent::Media(sh)).unwrap();
        tx.push(ConsumerEvent::Media(video(10))).unwrap();
        tx.push(ConsumerEvent::Media(video(200))).unwrap();
        let batch = rx.dump_packets(0);
        assert!(batch[0].is_video_sequence_header());
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_paused_queue_dumps_nothing() {
        let (tx, mut rx) = channel(10_000, JitterAlgorithm::Off);
        tx.push(ConsumerEvent::Media(video(0))).unwrap();
        rx.on_play_client_pause(true);
        assert!(rx.dump_packets(0).is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_once_min_msgs_buffered() {
        let (tx, mut rx) = channel(10_000, JitterAlgorithm::Off);
        tx.push(ConsumerEvent::Media(video(0))).unwrap();
        tx.push(ConsumerEvent::Media(video(10))).unwrap();
        rx.wait(2, Duration::from_secs(5)).await;
        assert_eq!(rx.dump_packets(0).len(), 2);
    }

    #[tokio::test]
    async fn test_wait_times_out_when_nothing_arrives() {
        let (_tx, mut rx) = channel(10_000, JitterAlgorithm::Off);
        let started = tokio::time::Instant::now();
        rx.wait(1, Duration::from_millis(20)).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
