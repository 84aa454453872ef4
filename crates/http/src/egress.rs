// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Live HTTP egress (component K): mount-template resolution, the
//! transmuxer contract shared by `flv`/`ts`/`audio`, and the request pump
//! that drains a consumer queue into an HTTP response.

use crate::framing::ResponseWriter;
use rtmpkit_core::error::{Error, Result};
use rtmpkit_core::types::{Message, MessageType, StreamKey};
use rtmpkit_live::{ConsumerOptions, JitterAlgorithm, SourceHandle, SourceRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

/// Default span of audio an [`AudioReplayCache`] tap keeps buffered, absent
/// any per-mount override (`spec.md` §4.K: "the first ~N ms of audio").
pub const DEFAULT_AUDIO_REPLAY_SPAN_MS: i64 = 3_000;

/// One container muxer. Implementations keep whatever per-connection state
/// they need (continuity counters, cached `AudioSpecificConfig`, ...) and
/// turn one RTMP-shaped [`Message`] at a time into container bytes.
pub trait Transmuxer: Send {
    fn content_type(&self) -> &'static str;
    /// Bytes to send once, immediately after the HTTP headers.
    fn header(&self) -> Vec<u8>;
    fn write_audio(&mut self, msg: &Message) -> Vec<u8>;
    fn write_video(&mut self, msg: &Message) -> Vec<u8>;
    fn write_metadata(&mut self, msg: &Message) -> Vec<u8>;
}

/// Which container a request's file extension asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Flv,
    Ts,
    Aac,
    Mp3,
}

impl ContainerKind {
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "flv" => Self::Flv,
            "ts" => Self::Ts,
            "aac" => Self::Aac,
            "mp3" => Self::Mp3,
            _ => return None,
        })
    }

    #[must_use]
    pub fn new_muxer(self, has_audio: bool, has_video: bool) -> Box<dyn Transmuxer> {
        match self {
            Self::Flv => Box::new(crate::flv::FlvMuxer::new(has_audio, has_video)),
            Self::Ts => Box::new(crate::ts::TsMuxer::new(has_audio)),
            Self::Aac => Box::new(crate::audio::AacMuxer::new()),
            Self::Mp3 => Box::new(crate::audio::Mp3Muxer),
        }
    }

    /// Whether this container carries audio-only streams without any
    /// sequence-header/GOP concept of its own, needing the encoder-side
    /// replay cache (`spec.md` §4.K).
    #[must_use]
    pub const fn is_audio_only(self) -> bool {
        matches!(self, Self::Aac | Self::Mp3)
    }
}

/// A mount pattern such as `[vhost]/[app]/[stream].flv`, matched against a
/// concrete request path to recover the stream key and requested container.
pub struct MountTemplate {
    segments: Vec<String>,
}

impl MountTemplate {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern.trim_start_matches('/').split('/').map(str::to_string).collect();
        Self { segments }
    }

    /// Matches `path` against this template, returning the recovered stream
    /// key and the file extension found on the final segment.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<(StreamKey, String)> {
        let path_segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        if path_segments.len() != self.segments.len() {
            return None;
        }
        let mut vhost = "__defaultVhost__".to_string();
        let mut app = String::new();
        let mut stream = String::new();
        let mut ext = String::new();
        for (template, actual) in self.segments.iter().zip(path_segments.iter()) {
            match template.as_str() {
                "[vhost]" => vhost = (*actual).to_string(),
                "[app]" => app = (*actual).to_string(),
                "[stream]" | "[stream].[ext]" => {
                    let (name, extension) = actual.rsplit_once('.')?;
                    stream = name.to_string();
                    ext = extension.to_string();
                },
                literal if literal.contains('.') => {
                    let (lit_name, lit_ext) = literal.rsplit_once('.')?;
                    let (name, extension) = actual.rsplit_once('.')?;
                    if lit_name != "[stream]" && lit_name != name {
                        return None;
                    }
                    stream = name.to_string();
                    ext = extension.to_string();
                },
                literal if literal != *actual => return None,
                _ => {},
            }
        }
        if app.is_empty() || stream.is_empty() {
            return None;
        }
        Some((StreamKey::new(vhost, app, stream), ext))
    }
}

/// A materialized mount instance: the concrete stream key and container a
/// request resolved to, cached by request path so repeat hits skip
/// re-matching against every template.
#[derive(Clone)]
pub struct LiveEntry {
    pub key: StreamKey,
    pub kind: ContainerKind,
}

/// Owns the `templates` and `instances` maps from `spec.md` §4.K.
pub struct MountRegistry {
    templates: Vec<MountTemplate>,
    instances: RwLock<HashMap<String, LiveEntry>>,
}

impl MountRegistry {
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        Self { templates: patterns.iter().map(|p| MountTemplate::parse(p)).collect(), instances: RwLock::new(HashMap::new()) }
    }

    /// Resolves `path` to a [`LiveEntry`], materializing (and caching) a new
    /// instance against the first matching template if none exists yet.
    pub async fn resolve(&self, path: &str) -> Option<LiveEntry> {
        if let Some(entry) = self.instances.read().await.get(path) {
            return Some(entry.clone());
        }
        for template in &self.templates {
            if let Some((key, ext)) = template.matches(path) {
                let Some(kind) = ContainerKind::from_extension(&ext) else { continue };
                let entry = LiveEntry { key, kind };
                self.instances.write().await.insert(path.to_string(), entry.clone());
                return Some(entry);
            }
        }
        None
    }
}

/// A short replay buffer of recent audio frames, re-played to each new
/// consumer of an audio-only mount so a joining AAC/MP3 listener doesn't
/// have to wait out a silent gap until the next frame arrives naturally.
pub struct AudioReplayCache {
    max_span_ms: i64,
    frames: Vec<Message>,
}

impl AudioReplayCache {
    #[must_use]
    pub const fn new(max_span_ms: i64) -> Self {
        Self { max_span_ms, frames: Vec::new() }
    }

    pub fn push(&mut self, msg: Message) {
        self.frames.push(msg);
        while let (Some(first), Some(last)) = (self.frames.first(), self.frames.last()) {
            if i64::from(last.timestamp_ms) - i64::from(first.timestamp_ms) <= self.max_span_ms {
                break;
            }
            self.frames.remove(0);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.frames.clone()
    }
}

/// Keeps one long-lived [`AudioReplayCache`] per audio-only mount, fed by a
/// background tap consumer spawned the first time that mount is requested
/// and torn down once the source unpublishes, so the cache is genuinely
/// "buffered at mount time" rather than rebuilt from whatever a fresh
/// consumer's own queue happens to hold (`spec.md` §4.K).
pub struct AudioTapRegistry {
    span_ms: i64,
    taps: Arc<RwLock<HashMap<StreamKey, Arc<RwLock<AudioReplayCache>>>>>,
}

impl AudioTapRegistry {
    #[must_use]
    pub fn new(span_ms: i64) -> Self {
        Self { span_ms, taps: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Returns the cache for `key`, spawning a tap task against `source` the
    /// first time this mount is seen. Subsequent calls for the same key
    /// reuse the same tap and cache.
    pub async fn get_or_spawn(&self, key: &StreamKey, source: &SourceHandle) -> Arc<RwLock<AudioReplayCache>> {
        if let Some(cache) = self.taps.read().await.get(key) {
            return cache.clone();
        }
        let mut taps = self.taps.write().await;
        if let Some(cache) = taps.get(key) {
            return cache.clone();
        }
        let cache = Arc::new(RwLock::new(AudioReplayCache::new(self.span_ms)));
        taps.insert(key.clone(), cache.clone());
        drop(taps);
        spawn_tap(key.clone(), source.clone(), cache.clone(), self.taps.clone());
        cache
    }
}

/// Attaches to `source` like any other consumer, but only to keep `cache`
/// topped up with audio frames; once the publisher goes away it detaches and
/// removes its own entry from `taps`, so a later republish spawns a fresh
/// tap instead of reusing a stale, unfed cache.
fn spawn_tap(
    key: StreamKey,
    source: SourceHandle,
    cache: Arc<RwLock<AudioReplayCache>>,
    taps: Arc<RwLock<HashMap<StreamKey, Arc<RwLock<AudioReplayCache>>>>>,
) {
    tokio::spawn(async move {
        let options = ConsumerOptions { max_queue_ms: 0, jitter: JitterAlgorithm::Off, seed_gop: false };
        let Ok((consumer_id, mut queue)) = source.attach(options).await else {
            taps.write().await.remove(&key);
            return;
        };
        loop {
            queue.wait(1, Duration::from_millis(200)).await;
            if queue.is_unpublished() {
                break;
            }
            for msg in queue.dump_packets(0) {
                if msg.msg_type == MessageType::Audio && !msg.is_audio_sequence_header() {
                    cache.write().await.push(msg);
                }
            }
        }
        source.detach(consumer_id).await;
        taps.write().await.remove(&key);
    });
}

/// Hooks the request pump invokes around the lifetime of an egress
/// connection (`spec.md` §4.K step 1 and step 5); implemented by `apps/rtmpd`
/// using the same HTTP-hook machinery the RTMP connection FSM uses.
#[async_trait::async_trait]
pub trait EgressHooks: Send + Sync {
    async fn on_play(&self, key: &StreamKey, request_url: &str) -> bool;
    async fn on_stop(&self, key: &StreamKey);
}

/// Serves one egress request end-to-end: attaches a consumer, writes
/// container framing, and pumps batches until the peer disconnects or the
/// source tears down.
///
/// For audio-only mounts, `audio_taps` seeds the response with a bounded
/// recent-audio replay (`spec.md` §4.K) instead of the hub's GOP cache,
/// which never clears for a source that carries no video.
///
/// # Errors
/// Propagates socket I/O errors from the response writer.
pub async fn serve_live<W: AsyncWrite + Unpin>(
    writer: &mut W,
    registry: &SourceRegistry,
    audio_taps: &AudioTapRegistry,
    entry: &LiveEntry,
    request_url: &str,
    hooks: &dyn EgressHooks,
) -> Result<()> {
    if !hooks.on_play(&entry.key, request_url).await {
        return Err(Error::Auth("on_play hook rejected request".into()));
    }

    let Some(source) = registry.get(entry.key.clone()).await else {
        return Err(Error::Stream(format!("no active source for {}", entry.key)));
    };

    let is_audio_only = entry.kind.is_audio_only();
    let options = ConsumerOptions { max_queue_ms: 10_000, jitter: JitterAlgorithm::Zero, seed_gop: !is_audio_only };
    let (consumer_id, mut queue) = source.attach(options).await?;

    let mut muxer = entry.kind.new_muxer(true, true);
    let mut response = ResponseWriter::new(writer);
    response.write_head(200, "OK", muxer.content_type(), None, &[]).await?;
    let header_bytes = muxer.header();
    if !header_bytes.is_empty() {
        response.write_body(&header_bytes).await?;
    }

    if is_audio_only {
        let cache = audio_taps.get_or_spawn(&entry.key, &source).await;
        let replay = cache.read().await.snapshot();
        let framed: Vec<Vec<u8>> = replay.iter().map(|msg| muxer.write_audio(msg)).filter(|bytes| !bytes.is_empty()).collect();
        if !framed.is_empty() {
            let slices: Vec<&[u8]> = framed.iter().map(Vec::as_slice).collect();
            response.write_body_vectored(&slices).await?;
        }
    }

    loop {
        queue.wait(1, Duration::from_millis(200)).await;
        if queue.is_unpublished() {
            break;
        }
        let batch = queue.dump_packets(0);
        if batch.is_empty() {
            continue;
        }
        let mut framed: Vec<Vec<u8>> = Vec::with_capacity(batch.len());
        for msg in &batch {
            let bytes = match msg.msg_type {
                MessageType::Audio => muxer.write_audio(msg),
                MessageType::Video => muxer.write_video(msg),
                MessageType::Amf0Data | MessageType::Amf3Data => muxer.write_metadata(msg),
                _ => Vec::new(),
            };
            if !bytes.is_empty() {
                framed.push(bytes);
            }
        }
        if framed.is_empty() {
            continue;
        }
        let slices: Vec<&[u8]> = framed.iter().map(Vec::as_slice).collect();
        if response.write_body_vectored(&slices).await.is_err() {
            break;
        }
    }

    source.detach(consumer_id).await;
    response.finish().await.ok();
    hooks.on_stop(&entry.key).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmpkit_live::SourceRegistry;

    struct AllowHooks;

    #[async_trait::async_trait]
    impl EgressHooks for AllowHooks {
        async fn on_play(&self, _key: &StreamKey, _request_url: &str) -> bool {
            true
        }

        async fn on_stop(&self, _key: &StreamKey) {}
    }

    fn key() -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", "sr1")
    }

    #[test]
    fn test_mount_template_matches_and_extracts_extension() {
        let template = MountTemplate::parse("[vhost]/[app]/[stream]");
        let (key, ext) = template.matches("__defaultVhost__/live/sr1.flv").unwrap();
        assert_eq!(key.app, "live");
        assert_eq!(key.stream, "sr1");
        assert_eq!(ext, "flv");
    }

    #[test]
    fn test_mount_template_rejects_segment_count_mismatch() {
        let template = MountTemplate::parse("[vhost]/[app]/[stream]");
        assert!(template.matches("live/sr1.flv").is_none());
    }

    #[test]
    fn test_audio_replay_cache_drops_frames_past_span() {
        let mut cache = AudioReplayCache::new(100);
        cache.push(Message::new(MessageType::Audio, 0, 1, bytes::Bytes::new()));
        cache.push(Message::new(MessageType::Audio, 50, 1, bytes::Bytes::new()));
        cache.push(Message::new(MessageType::Audio, 250, 1, bytes::Bytes::new()));
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].timestamp_ms, 250);
    }

    #[tokio::test]
    async fn test_audio_tap_registry_reuses_same_cache_for_repeat_lookups() {
        let registry = SourceRegistry::spawn();
        let source = registry.get_or_create(key(), true).await;
        source.acquire_publish(false, None).await.unwrap();

        let taps = AudioTapRegistry::new(1_000);
        let first = taps.get_or_spawn(&key(), &source).await;
        let second = taps.get_or_spawn(&key(), &source).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_audio_tap_registry_continuously_buffers_audio_from_source() {
        let registry = SourceRegistry::spawn();
        let source = registry.get_or_create(key(), true).await;
        source.acquire_publish(false, None).await.unwrap();

        let taps = AudioTapRegistry::new(1_000);
        let cache = taps.get_or_spawn(&key(), &source).await;
        for ts in [0u32, 20, 40] {
            source.on_audio(Message::new(MessageType::Audio, ts, 1, bytes::Bytes::from_static(&[0xAF, 1, 2, 3]))).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(260)).await;
        assert_eq!(cache.read().await.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_serve_live_audio_only_mount_seeds_response_from_tap_cache() {
        let registry = SourceRegistry::spawn();
        let source = registry.get_or_create(key(), true).await;
        source.acquire_publish(false, None).await.unwrap();

        let taps = AudioTapRegistry::new(1_000);
        let cache = taps.get_or_spawn(&key(), &source).await;
        for ts in [0u32, 20, 40] {
            source.on_audio(Message::new(MessageType::Audio, ts, 1, bytes::Bytes::from_static(&[0xAF, 1, 2, 3]))).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(260)).await;
        assert_eq!(cache.read().await.snapshot().len(), 3);

        let entry = LiveEntry { key: key(), kind: ContainerKind::Aac };
        let serve_task = tokio::spawn(async move {
            let mut out = Vec::new();
            serve_live(&mut out, &registry, &taps, &entry, "http://host/live/sr1.aac", &AllowHooks).await.unwrap();
            out
        });

        // Give serve_live time to attach and seed the replay before the
        // source goes away; unpublish is what lets the pump loop exit.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        source.unpublish().await;
        let out = tokio::time::timeout(std::time::Duration::from_secs(2), serve_task).await.unwrap().unwrap();

        // The tap's 3 buffered frames were muxed into the response before the
        // pump loop observed the unpublish and exited.
        assert!(out.len() > 20);
    }
}
