// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory three-level statistics registry (vhost → stream → client).
//!
//! Fields and JSON shapes are ported from
//! `examples/original_source/app_statistic.cpp`'s `Dumps()` methods. Updates
//! are synchronous, called directly from the connection FSM — there is no
//! background thread here, matching the single-writer-per-task concurrency
//! model in `spec.md` §5.

use crate::rate::{Kbps, Window};
use crate::types::ConnType;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct VhostStats {
    pub id: String,
    pub name: String,
    pub clients: u32,
    pub streams: u32,
    pub send_bytes: u64,
    pub recv_bytes: u64,
    pub kbps_recv_30s: i32,
    pub kbps_send_30s: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodecVideo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodecAudio {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub id: String,
    pub name: String,
    pub vhost_id: String,
    pub app: String,
    pub tc_url: String,
    pub url: String,
    pub clients: u32,
    pub frames: u64,
    pub send_bytes: u64,
    pub recv_bytes: u64,
    pub kbps_recv_30s: i32,
    pub kbps_send_30s: i32,
    pub publish_active: bool,
    pub publish_cid: Option<String>,
    pub video: Option<CodecVideo>,
    pub audio: Option<CodecAudio>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: String,
    pub vhost_id: String,
    pub stream_id: Option<String>,
    pub ip: String,
    pub page_url: String,
    pub conn_type: ConnType,
    #[serde(skip)]
    connected_at: Option<Instant>,
    pub alive_seconds: u64,
}

struct VhostEntry {
    stats: VhostStats,
    kbps: Kbps,
    streams: Vec<String>,
}

struct StreamEntry {
    stats: StreamStats,
    kbps: Kbps,
    clients: Vec<String>,
}

/// The three-level registry. Keys are server-generated ids (`v-N`, `s-N`,
/// `c-N`); reverse maps let callers look an entry up by its natural name
/// (vhost name, stream url, client id is already its own key).
#[derive(Default)]
pub struct Statistics {
    vhosts: HashMap<String, VhostEntry>,
    vhost_by_name: HashMap<String, String>,
    streams: HashMap<String, StreamEntry>,
    stream_by_url: HashMap<String, String>,
    clients: HashMap<String, ClientStats>,
    next_id: u64,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn gen_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Looks up or creates the vhost entry for `name`.
    pub fn on_vhost(&mut self, name: &str) -> String {
        if let Some(id) = self.vhost_by_name.get(name) {
            return id.clone();
        }
        let id = self.gen_id("v");
        self.vhosts.insert(
            id.clone(),
            VhostEntry {
                stats: VhostStats {
                    id: id.clone(),
                    name: name.to_string(),
                    clients: 0,
                    streams: 0,
                    send_bytes: 0,
                    recv_bytes: 0,
                    kbps_recv_30s: 0,
                    kbps_send_30s: 0,
                },
                kbps: Kbps::new(),
                streams: Vec::new(),
            },
        );
        self.vhost_by_name.insert(name.to_string(), id.clone());
        id
    }

    /// Looks up or creates the stream entry for `url` (vhost/app/stream).
    pub fn on_stream(&mut self, vhost_id: &str, app: &str, name: &str, tc_url: &str, url: &str) -> String {
        if let Some(id) = self.stream_by_url.get(url) {
            return id.clone();
        }
        let id = self.gen_id("s");
        self.streams.insert(
            id.clone(),
            StreamEntry {
                stats: StreamStats {
                    id: id.clone(),
                    name: name.to_string(),
                    vhost_id: vhost_id.to_string(),
                    app: app.to_string(),
                    tc_url: tc_url.to_string(),
                    url: url.to_string(),
                    clients: 0,
                    frames: 0,
                    send_bytes: 0,
                    recv_bytes: 0,
                    kbps_recv_30s: 0,
                    kbps_send_30s: 0,
                    publish_active: false,
                    publish_cid: None,
                    video: None,
                    audio: None,
                },
                kbps: Kbps::new(),
                clients: Vec::new(),
            },
        );
        self.stream_by_url.insert(url.to_string(), id.clone());
        if let Some(vhost) = self.vhosts.get_mut(vhost_id) {
            vhost.streams.push(id.clone());
            vhost.stats.streams = vhost.streams.len() as u32;
        }
        id
    }

    /// Registers a new client connection, returning its generated id.
    pub fn on_client(&mut self, vhost_id: &str, ip: &str, page_url: &str, conn_type: ConnType) -> String {
        let id = self.gen_id("c");
        self.clients.insert(
            id.clone(),
            ClientStats {
                id: id.clone(),
                vhost_id: vhost_id.to_string(),
                stream_id: None,
                ip: ip.to_string(),
                page_url: page_url.to_string(),
                conn_type,
                connected_at: Some(Instant::now()),
                alive_seconds: 0,
            },
        );
        if let Some(vhost) = self.vhosts.get_mut(vhost_id) {
            vhost.stats.clients += 1;
        }
        id
    }

    /// Attaches an already-registered client to a stream (on play/publish
    /// start) so it shows up in that stream's client list.
    pub fn on_client_stream(&mut self, client_id: &str, stream_id: &str) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.stream_id = Some(stream_id.to_string());
        }
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if !stream.clients.iter().any(|c| c == client_id) {
                stream.clients.push(client_id.to_string());
                stream.stats.clients = stream.clients.len() as u32;
            }
        }
    }

    pub fn on_publish_start(&mut self, stream_id: &str, client_id: &str) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.stats.publish_active = true;
            stream.stats.publish_cid = Some(client_id.to_string());
        }
    }

    pub fn on_video_info(&mut self, stream_id: &str, codec: &str, width: u32, height: u32) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.stats.video = Some(CodecVideo { codec: codec.to_string(), width, height });
        }
    }

    pub fn on_audio_info(&mut self, stream_id: &str, codec: &str, sample_rate: u32, channels: u8) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.stats.audio = Some(CodecAudio { codec: codec.to_string(), sample_rate, channels });
        }
    }

    pub fn on_video_frames(&mut self, stream_id: &str, frames: u64) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.stats.frames += frames;
        }
    }

    /// Records bytes transferred, updating both the stream's and its
    /// vhost's cumulative counters and sliding-window Kbps.
    pub fn on_bytes(&mut self, stream_id: &str, sent: u64, recvd: u64) {
        let vhost_id = if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.kbps.add_send(sent);
            stream.kbps.add_recv(recvd);
            stream.stats.send_bytes = stream.kbps.send_bytes();
            stream.stats.recv_bytes = stream.kbps.recv_bytes();
            stream.stats.kbps_send_30s = stream.kbps.send_kbps(Window::Secs30);
            stream.stats.kbps_recv_30s = stream.kbps.recv_kbps(Window::Secs30);
            Some(stream.stats.vhost_id.clone())
        } else {
            None
        };
        if let Some(vhost) = vhost_id.and_then(|id| self.vhosts.get_mut(&id)) {
            vhost.kbps.add_send(sent);
            vhost.kbps.add_recv(recvd);
            vhost.stats.send_bytes = vhost.kbps.send_bytes();
            vhost.stats.recv_bytes = vhost.kbps.recv_bytes();
            vhost.stats.kbps_send_30s = vhost.kbps.send_kbps(Window::Secs30);
            vhost.stats.kbps_recv_30s = vhost.kbps.recv_kbps(Window::Secs30);
        }
    }

    pub fn on_unpublish(&mut self, stream_id: &str) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.stats.publish_active = false;
            stream.stats.publish_cid = None;
        }
    }

    /// Removes a client on disconnect, detaching it from its stream and
    /// decrementing both client counters.
    pub fn on_disconnect(&mut self, client_id: &str) {
        let Some(client) = self.clients.remove(client_id) else { return };
        if let Some(vhost) = self.vhosts.get_mut(&client.vhost_id) {
            vhost.stats.clients = vhost.stats.clients.saturating_sub(1);
        }
        if let Some(stream_id) = &client.stream_id {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.clients.retain(|c| c != client_id);
                stream.stats.clients = stream.clients.len() as u32;
            }
        }
    }

    /// JSON snapshot of every vhost, suitable for an operator-facing HTTP
    /// endpoint.
    #[must_use]
    pub fn dump_vhosts(&self) -> serde_json::Value {
        serde_json::json!(self.vhosts.values().map(|v| &v.stats).collect::<Vec<_>>())
    }

    #[must_use]
    pub fn dump_streams(&self) -> serde_json::Value {
        serde_json::json!(self.streams.values().map(|s| &s.stats).collect::<Vec<_>>())
    }

    #[must_use]
    pub fn dump_clients(&self) -> serde_json::Value {
        serde_json::json!(self.clients.values().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhost_lookup_is_idempotent() {
        let mut stats = Statistics::new();
        let a = stats.on_vhost("__defaultVhost__");
        let b = stats.on_vhost("__defaultVhost__");
        assert_eq!(a, b);
    }

    #[test]
    fn test_client_lifecycle_updates_counts() {
        let mut stats = Statistics::new();
        let vhost = stats.on_vhost("v1");
        let client = stats.on_client(&vhost, "127.0.0.1", "", ConnType::Play);
        assert_eq!(stats.vhosts[&vhost].stats.clients, 1);
        stats.on_disconnect(&client);
        assert_eq!(stats.vhosts[&vhost].stats.clients, 0);
    }

    #[test]
    fn test_stream_attach_and_publish_flags() {
        let mut stats = Statistics::new();
        let vhost = stats.on_vhost("v1");
        let stream = stats.on_stream(&vhost, "live", "sr1", "rtmp://h/live", "v1/live/sr1");
        let client = stats.on_client(&vhost, "1.2.3.4", "", ConnType::FlashPublish);
        stats.on_client_stream(&client, &stream);
        stats.on_publish_start(&stream, &client);
        assert!(stats.streams[&stream].stats.publish_active);
        assert_eq!(stats.streams[&stream].stats.clients, 1);
        stats.on_unpublish(&stream);
        assert!(!stats.streams[&stream].stats.publish_active);
    }

    #[test]
    fn test_dump_is_valid_json_array() {
        let mut stats = Statistics::new();
        let _ = stats.on_vhost("v1");
        let dump = stats.dump_vhosts();
        assert!(dump.is_array());
    }
}
