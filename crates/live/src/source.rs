// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The live source hub (component H): one actor task per `(vhost, app,
//! stream)` key, generalizing the control-plane actor shape in
//! `streamkit-engine::dynamic_actor` from a pipeline-graph actor to a
//! publish/fan-out actor. There is no shared state between connections —
//! every admission decision and every fan-out write happens on this one
//! task, so "fetch-or-create is a single logical operation" and "no
//! per-consumer reordering" fall out of the model for free.

use crate::consumer::{self, ConsumerEvent, ConsumerQueue, ConsumerSender, JitterAlgorithm};
use bytes::Bytes;
use rtmpkit_core::error::{Error, Result};
use rtmpkit_core::types::{Message, MessageType, StreamKey};
use rtmpkit_proto::amf0::Amf0Value;
use rtmpkit_proto::command::{self, Packet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Injected by `apps/rtmpd` so the hub never depends on the concrete RTMP
/// client used to reach an edge's configured origin(s) (`spec.md` §4.H
/// "Supplement"). The real implementation is an RTMP client built from
/// `rtmpkit-proto`'s own handshake/chunk/command blocks.
#[async_trait::async_trait]
pub trait EdgeUpstream: Send + Sync {
    async fn forward(&self, msg: &Message) -> Result<()>;
}

/// Per-attach tuning a connection supplies when it joins as a consumer.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub max_queue_ms: i64,
    pub jitter: JitterAlgorithm,
    /// Whether this attach should be seeded with the accumulated GOP cache.
    /// Normal RTMP/HTTP-FLV playback wants it; a consumer that maintains its
    /// own bounded replay window (`spec.md` §4.K's audio-only encoder-side
    /// cache) sets this `false` so it isn't also handed the hub's unbounded
    /// per-source history.
    pub seed_gop: bool,
}

pub type ConsumerId = u64;

enum SourceCommand {
    Publish { edge: bool, upstream: Option<Arc<dyn EdgeUpstream>>, resp: oneshot::Sender<Result<()>> },
    Unpublish,
    Audio(Message),
    Video(Message),
    Metadata(Message),
    Aggregate(Message),
    EdgeProxyPublish(Message),
    Attach { options: ConsumerOptions, resp: oneshot::Sender<ConsumerQueue> },
    Detach(ConsumerId),
}

/// Cloneable handle to a running source actor.
#[derive(Clone)]
pub struct SourceHandle {
    tx: mpsc::Sender<SourceCommand>,
}

impl SourceHandle {
    /// Admission + publish-start in one round trip: `Err` means `stream_busy`.
    pub async fn acquire_publish(&self, edge: bool, upstream: Option<Arc<dyn EdgeUpstream>>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(SourceCommand::Publish { edge, upstream, resp })
            .await
            .map_err(|_| Error::Stream("source actor gone".into()))?;
        rx.await.map_err(|_| Error::Stream("source actor gone".into()))?
    }

    pub async fn unpublish(&self) {
        let _ = self.tx.send(SourceCommand::Unpublish).await;
    }

    pub async fn on_audio(&self, msg: Message) {
        let _ = self.tx.send(SourceCommand::Audio(msg)).await;
    }

    pub async fn on_video(&self, msg: Message) {
        let _ = self.tx.send(SourceCommand::Video(msg)).await;
    }

    pub async fn on_metadata(&self, msg: Message) {
        let _ = self.tx.send(SourceCommand::Metadata(msg)).await;
    }

    pub async fn on_aggregate(&self, msg: Message) {
        let _ = self.tx.send(SourceCommand::Aggregate(msg)).await;
    }

    pub async fn on_edge_proxy_publish(&self, msg: Message) {
        let _ = self.tx.send(SourceCommand::EdgeProxyPublish(msg)).await;
    }

    /// Attaches a new consumer, receiving a queue already seeded with
    /// metadata, sequence headers and the current GOP (`spec.md` §4.H
    /// "Consumer attach").
    pub async fn attach(&self, options: ConsumerOptions) -> Result<(ConsumerId, ConsumerQueue)> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(SourceCommand::Attach { options, resp })
            .await
            .map_err(|_| Error::Stream("source actor gone".into()))?;
        let queue = rx.await.map_err(|_| Error::Stream("source actor gone".into()))?;
        Ok((queue.consumer_id(), queue))
    }

    pub async fn detach(&self, id: ConsumerId) {
        let _ = self.tx.send(SourceCommand::Detach(id)).await;
    }
}

struct LiveSourceActor {
    key: StreamKey,
    gop_enabled: bool,
    rx: mpsc::Receiver<SourceCommand>,
    publisher_present: bool,
    is_edge_publisher: bool,
    edge_upstream: Option<Arc<dyn EdgeUpstream>>,
    video_sh: Option<Message>,
    audio_sh: Option<Message>,
    meta: Option<Message>,
    gop: Vec<Message>,
    consumers: Vec<(ConsumerId, ConsumerSender)>,
    next_consumer_id: ConsumerId,
    evict: mpsc::Sender<StreamKey>,
}

/// Spawns a new source actor for `key`, returning a handle to it. `evict` is
/// signalled once the source has neither a publisher nor any consumer left,
/// so the registry can drop its entry.
pub fn spawn(key: StreamKey, gop_enabled: bool, evict: mpsc::Sender<StreamKey>) -> SourceHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = LiveSourceActor {
        key,
        gop_enabled,
        rx,
        publisher_present: false,
        is_edge_publisher: false,
        edge_upstream: None,
        video_sh: None,
        audio_sh: None,
        meta: None,
        gop: Vec::new(),
        consumers: Vec::new(),
        next_consumer_id: 0,
        evict,
    };
    tokio::spawn(actor.run());
    SourceHandle { tx }
}

impl LiveSourceActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                SourceCommand::Publish { edge, upstream, resp } => {
                    let result = self.handle_publish(edge, upstream);
                    let _ = resp.send(result);
                },
                SourceCommand::Unpublish => self.handle_unpublish().await,
                SourceCommand::Audio(msg) => self.handle_audio(msg).await,
                SourceCommand::Video(msg) => self.handle_video(msg).await,
                SourceCommand::Metadata(msg) => self.handle_metadata(msg).await,
                SourceCommand::Aggregate(msg) => self.handle_aggregate(msg).await,
                SourceCommand::EdgeProxyPublish(msg) => self.handle_edge_proxy_publish(msg).await,
                SourceCommand::Attach { options, resp } => {
                    let queue = self.handle_attach(options);
                    let _ = resp.send(queue);
                },
                SourceCommand::Detach(id) => {
                    self.consumers.retain(|(cid, _)| *cid != id);
                    self.maybe_evict().await;
                },
            }
        }
    }

    /// `can_publish`: true iff no active publisher, or the caller is the
    /// edge proxy for an already-edge-sourced publisher.
    const fn can_publish(&self, edge: bool) -> bool {
        !self.publisher_present || (edge && self.is_edge_publisher)
    }

    fn handle_publish(&mut self, edge: bool, upstream: Option<Arc<dyn EdgeUpstream>>) -> Result<()> {
        if !self.can_publish(edge) {
            return Err(Error::Stream(format!("stream busy: {}", self.key.stream)));
        }
        self.publisher_present = true;
        self.is_edge_publisher = edge;
        self.edge_upstream = upstream;
        if self.gop_enabled {
            self.gop.clear();
        }
        Ok(())
    }

    async fn handle_unpublish(&mut self) {
        self.publisher_present = false;
        self.is_edge_publisher = false;
        self.edge_upstream = None;
        self.broadcast(ConsumerEvent::Unpublish).await;
        self.maybe_evict().await;
    }

    async fn handle_audio(&mut self, msg: Message) {
        if msg.is_audio_sequence_header() {
            self.audio_sh = Some(msg.clone());
        } else if self.gop_enabled {
            self.gop.push(msg.clone());
        }
        self.broadcast(ConsumerEvent::Media(msg)).await;
    }

    async fn handle_video(&mut self, msg: Message) {
        if msg.is_video_sequence_header() {
            self.video_sh = Some(msg.clone());
        } else if msg.is_video_key_frame() {
            if self.gop_enabled {
                self.gop.clear();
                self.gop.push(msg.clone());
            }
        } else if self.gop_enabled {
            self.gop.push(msg.clone());
        }
        self.broadcast(ConsumerEvent::Media(msg)).await;
    }

    /// Enriches `onMetaData`: strips a handful of client-private keys and
    /// stamps this hub's own signature, per `spec.md` §4.H.
    async fn handle_metadata(&mut self, msg: Message) {
        let Ok(Packet::OnMetaData { mut data }) = command::decode_message(&msg) else { return };
        data.retain(|(k, _)| k != "filesize" && k != "duration");
        data.push(("server".to_string(), Amf0Value::str("RtmpKit")));
        let Ok(encoded) = command::encode(&Packet::OnMetaData { data }) else { return };
        let enriched = Message::new(MessageType::Amf0Data, msg.timestamp_ms, msg.stream_id, Bytes::from(encoded));
        self.meta = Some(enriched.clone());
        self.broadcast(ConsumerEvent::Media(enriched)).await;
    }

    /// Splits an aggregate message into its FLV-style sub-messages, rebasing
    /// sub-timestamps relative to the aggregate's own timestamp (`spec.md`
    /// §9 Open Questions: treated as relative).
    async fn handle_aggregate(&mut self, msg: Message) {
        let mut offset = 0usize;
        let payload = &msg.payload;
        let mut first_sub_ts: Option<i64> = None;
        let mut subs = Vec::new();
        while offset + 11 <= payload.len() {
            let type_byte = payload[offset];
            let size = (usize::from(payload[offset + 1]) << 16) | (usize::from(payload[offset + 2]) << 8) | usize::from(payload[offset + 3]);
            let ts = (u32::from(payload[offset + 4]) << 16) | (u32::from(payload[offset + 5]) << 8) | u32::from(payload[offset + 6]);
            let ts = ts | (u32::from(payload[offset + 7]) << 24);
            let data_start = offset + 11;
            let data_end = data_start + size;
            if data_end > payload.len() {
                break;
            }
            let sub_ts = i64::from(ts);
            let base = *first_sub_ts.get_or_insert(sub_ts);
            let rebased = (i64::from(msg.timestamp_ms) + (sub_ts - base)).max(0) as u32;
            if let Some(sub_type) = MessageType::from_u8(type_byte) {
                subs.push(Message::new(sub_type, rebased, msg.stream_id, payload.slice(data_start..data_end)));
            }
            offset = data_end + 4;
        }
        for sub in subs {
            match sub.msg_type {
                MessageType::Audio => self.handle_audio(sub).await,
                MessageType::Video => self.handle_video(sub).await,
                MessageType::Amf0Data | MessageType::Amf3Data => self.handle_metadata(sub).await,
                _ => {},
            }
        }
    }

    async fn handle_edge_proxy_publish(&mut self, msg: Message) {
        if let Some(upstream) = self.edge_upstream.clone() {
            if let Err(err) = upstream.forward(&msg).await {
                tracing::warn!(stream = %self.key.stream, error = %err, "edge proxy forward failed");
            }
        }
    }

    fn handle_attach(&mut self, options: ConsumerOptions) -> ConsumerQueue {
        let (sender, mut queue) = consumer::channel(options.max_queue_ms, options.jitter);
        if let Some(meta) = &self.meta {
            let _ = sender.push(ConsumerEvent::Media(meta.clone()));
        }
        if let Some(video_sh) = &self.video_sh {
            let _ = sender.push(ConsumerEvent::Media(video_sh.clone()));
        }
        if let Some(audio_sh) = &self.audio_sh {
            let _ = sender.push(ConsumerEvent::Media(audio_sh.clone()));
        }
        if self.gop_enabled && options.seed_gop {
            for msg in &self.gop {
                let _ = sender.push(ConsumerEvent::Media(msg.clone()));
            }
        }
        let id = self.next_consumer_id;
        self.next_consumer_id += 1;
        queue.set_consumer_id(id);
        self.consumers.push((id, sender));
        queue
    }

    async fn broadcast(&mut self, event: ConsumerEvent) {
        self.consumers.retain(|(_, sender)| sender.push(event.clone()).is_ok());
    }

    async fn maybe_evict(&mut self) {
        if !self.publisher_present && self.consumers.is_empty() {
            let _ = self.evict.send(self.key.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", "sr1")
    }

    fn handle() -> SourceHandle {
        let (evict_tx, _evict_rx) = mpsc::channel(1);
        spawn(key(), true, evict_tx)
    }

    fn video_key_frame(ts: u32) -> Message {
        Message::new(MessageType::Video, ts, 1, Bytes::from_static(&[0x17, 1, 0, 0, 0]))
    }

    fn video_inter_frame(ts: u32) -> Message {
        Message::new(MessageType::Video, ts, 1, Bytes::from_static(&[0x27, 1, 0, 0, 0]))
    }

    #[tokio::test]
    async fn test_second_publisher_is_rejected_while_first_is_active() {
        let source = handle();
        source.acquire_publish(false, None).await.unwrap();
        let err = source.acquire_publish(false, None).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[tokio::test]
    async fn test_publish_allowed_again_after_unpublish() {
        let source = handle();
        source.acquire_publish(false, None).await.unwrap();
        source.unpublish().await;
        source.acquire_publish(false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_attach_receives_sequence_headers_then_gop() {
        let source = handle();
        source.acquire_publish(false, None).await.unwrap();

        let video_sh = Message::new(MessageType::Video, 0, 1, Bytes::from_static(&[0x17, 0, 0, 0, 0]));
        source.on_video(video_sh).await;
        source.on_video(video_key_frame(1000)).await;
        source.on_video(video_inter_frame(1016)).await;

        let options = ConsumerOptions { max_queue_ms: 10_000, jitter: JitterAlgorithm::Off, seed_gop: true };
        let (_id, mut queue) = source.attach(options).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let batch = queue.dump_packets(0);

        assert!(batch[0].is_video_sequence_header());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1].timestamp_ms, 1000);
        assert_eq!(batch[2].timestamp_ms, 1016);
    }

    #[tokio::test]
    async fn test_unpublish_broadcasts_to_attached_consumer() {
        let source = handle();
        source.acquire_publish(false, None).await.unwrap();
        let options = ConsumerOptions { max_queue_ms: 10_000, jitter: JitterAlgorithm::Off, seed_gop: true };
        let (_id, mut queue) = source.attach(options).await.unwrap();
        source.unpublish().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.dump_packets(0);
        assert!(queue.is_unpublished());
    }

    #[tokio::test]
    async fn test_metadata_strips_filesize_and_adds_server_signature() {
        let source = handle();
        source.acquire_publish(false, None).await.unwrap();
        let data = vec![("filesize".to_string(), Amf0Value::Number(0.0)), ("width".to_string(), Amf0Value::Number(1280.0))];
        let payload = command::encode(&Packet::OnMetaData { data }).unwrap();
        source.on_metadata(Message::new(MessageType::Amf0Data, 0, 1, Bytes::from(payload))).await;

        let options = ConsumerOptions { max_queue_ms: 10_000, jitter: JitterAlgorithm::Off, seed_gop: true };
        let (_id, mut queue) = source.attach(options).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let batch = queue.dump_packets(0);
        let Packet::OnMetaData { data } = command::decode(&batch[0].payload, true).unwrap() else { panic!("expected metadata") };
        assert!(data.iter().any(|(k, _)| k == "server"));
        assert!(!data.iter().any(|(k, _)| k == "filesize"));
    }
}
