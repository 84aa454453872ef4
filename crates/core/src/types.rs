// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wire-independent data model shared by the chunk protocol, the live
//! source hub and the HTTP egress layer.
//!
//! [`Message`] is the unit of fan-out: the chunk protocol decodes a chunk
//! stream into a sequence of `Message`s, the live source hub broadcasts
//! `Message`s to consumers, and the chunk protocol re-encodes them onto an
//! outbound socket (or the HTTP egress layer transmuxes them into a
//! container). Nothing above the chunk protocol layer needs to know how a
//! `Message` was chunked on the wire.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

/// The canonical `(vhost, app, stream)` tuple. Two requests with an equal
/// key share a single [`crate::types::Request::get_stream_url`] and, at the
/// live-source layer, a single source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamKey {
    #[must_use]
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, stream: impl Into<String>) -> Self {
        Self { vhost: vhost.into(), app: app.into(), stream: stream.into() }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// RTMP message types, as carried on the wire by the chunk protocol's
/// message-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum MessageType {
    SetChunkSize = 1,
    Abort = 2,
    Ack = 3,
    UserControl = 4,
    AckWindowSize = 5,
    SetPeerBandwidth = 6,
    Audio = 8,
    Video = 9,
    Amf3Data = 15,
    Amf3Shared = 16,
    Amf3Command = 17,
    Amf0Data = 18,
    Amf0Shared = 19,
    Amf0Command = 20,
    Aggregate = 22,
}

impl MessageType {
    /// Maps a raw RTMP message-type byte to a [`MessageType`].
    ///
    /// # Errors
    /// Returns `None` for bytes not defined by RTMP 1.0.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::SetChunkSize,
            2 => Self::Abort,
            3 => Self::Ack,
            4 => Self::UserControl,
            5 => Self::AckWindowSize,
            6 => Self::SetPeerBandwidth,
            8 => Self::Audio,
            9 => Self::Video,
            15 => Self::Amf3Data,
            16 => Self::Amf3Shared,
            17 => Self::Amf3Command,
            18 => Self::Amf0Data,
            19 => Self::Amf0Shared,
            20 => Self::Amf0Command,
            22 => Self::Aggregate,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn is_command(self) -> bool {
        matches!(self, Self::Amf0Command | Self::Amf3Command)
    }

    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Amf0Data | Self::Amf3Data)
    }

    /// AMF3 command/data messages carry one leading type-marker byte
    /// before the AMF0-compatible body (`spec.md` §6).
    #[must_use]
    pub const fn is_amf3(self) -> bool {
        matches!(self, Self::Amf3Command | Self::Amf3Data | Self::Amf3Shared)
    }

    #[must_use]
    pub const fn is_protocol_control(self) -> bool {
        matches!(
            self,
            Self::SetChunkSize | Self::Abort | Self::Ack | Self::UserControl | Self::AckWindowSize | Self::SetPeerBandwidth
        )
    }
}

/// Video/audio frame flags, derived from the first byte(s) of the payload
/// by [`Message::video_frame_flags`]/[`Message::audio_is_sequence_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    pub is_key_frame: bool,
    pub is_inter_frame: bool,
    pub is_sequence_header: bool,
}

/// A complete RTMP application-layer unit: audio, video, a command, shared
/// object traffic, or a protocol-control message. Delivered by the chunk
/// protocol as one value regardless of how many chunks it took on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    /// 31-bit semantic timestamp in milliseconds.
    pub timestamp_ms: u32,
    pub stream_id: u32,
    /// The chunk-id the encoder prefers to send this message on; ignored on
    /// the receive side, set by the producer (hub/consumer) on the send side.
    pub preferred_chunk_id: u32,
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(msg_type: MessageType, timestamp_ms: u32, stream_id: u32, payload: Bytes) -> Self {
        Self { msg_type, timestamp_ms, stream_id, preferred_chunk_id: default_cid_for(msg_type), payload }
    }

    /// `true` if this is a video message whose tag byte marks an AVC
    /// sequence header (frame type 1, codec id 7, AVC packet type 0).
    #[must_use]
    pub fn is_video_sequence_header(&self) -> bool {
        self.msg_type == MessageType::Video
            && self.payload.len() >= 2
            && (self.payload[0] >> 4) == 1 // key frame
            && (self.payload[0] & 0x0f) == 7 // AVC
            && self.payload[1] == 0
    }

    /// `true` if this is a video message whose tag byte marks a key frame.
    #[must_use]
    pub fn is_video_key_frame(&self) -> bool {
        self.msg_type == MessageType::Video && !self.payload.is_empty() && (self.payload[0] >> 4) == 1
    }

    /// `true` if this is an audio message whose tag byte marks an AAC
    /// sequence header (sound format 10, AAC packet type 0).
    #[must_use]
    pub fn is_audio_sequence_header(&self) -> bool {
        self.msg_type == MessageType::Audio
            && self.payload.len() >= 2
            && (self.payload[0] >> 4) == 10 // AAC
            && self.payload[1] == 0
    }

    #[must_use]
    pub fn frame_flags(&self) -> FrameFlags {
        match self.msg_type {
            MessageType::Video => FrameFlags {
                is_key_frame: self.is_video_key_frame(),
                is_inter_frame: !self.payload.is_empty() && (self.payload[0] >> 4) == 2,
                is_sequence_header: self.is_video_sequence_header(),
            },
            MessageType::Audio => FrameFlags {
                is_key_frame: false,
                is_inter_frame: false,
                is_sequence_header: self.is_audio_sequence_header(),
            },
            _ => FrameFlags::default(),
        }
    }
}

const fn default_cid_for(t: MessageType) -> u32 {
    match t {
        MessageType::Audio => 4,
        MessageType::Video => 6,
        MessageType::Amf0Command | MessageType::Amf3Command => 3,
        MessageType::Amf0Data | MessageType::Amf3Data => 4,
        _ => 2,
    }
}

/// The per-connection client classification discovered by the identify FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnType {
    Unknown,
    Play,
    FmlePublish,
    FlashPublish,
    HaivisionPublish,
}

impl ConnType {
    #[must_use]
    pub const fn is_publish(self) -> bool {
        matches!(self, Self::FmlePublish | Self::FlashPublish | Self::HaivisionPublish)
    }
}

/// The connect/play/publish request summary threaded through the connection
/// FSM, security checks, hooks and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub tc_url: String,
    pub page_url: String,
    pub swf_url: String,
    pub schema: String,
    pub host: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub port: u16,
    pub param: String,
    pub duration_ms: Option<u64>,
    pub object_encoding: f64,
    pub ip: String,
}

impl Request {
    /// `vhost/app/stream`, the canonical presentation URL used for GOP
    /// cache keys, statistics, and log lines.
    #[must_use]
    pub fn get_stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    #[must_use]
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.vhost.clone(), self.app.clone(), self.stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for raw in [1u8, 2, 3, 4, 5, 6, 8, 9, 15, 16, 17, 18, 19, 20, 22] {
            let t = MessageType::from_u8(raw).expect("known type");
            assert_eq!(t as u8, raw);
        }
        assert!(MessageType::from_u8(0).is_none());
        assert!(MessageType::from_u8(100).is_none());
    }

    #[test]
    fn test_video_key_frame_detection() {
        let msg = Message::new(MessageType::Video, 0, 1, Bytes::from_static(&[0x17, 0, 0, 0, 0]));
        let flags = msg.frame_flags();
        assert!(flags.is_key_frame);
        assert!(!flags.is_sequence_header);
    }

    #[test]
    fn test_video_sequence_header_detection() {
        let msg = Message::new(MessageType::Video, 0, 1, Bytes::from_static(&[0x17, 0, 0, 0, 0, 1, 2, 3]));
        assert!(msg.is_video_sequence_header());
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new("__defaultVhost__", "live", "sr1");
        assert_eq!(key.to_string(), "__defaultVhost__/live/sr1");
    }
}
