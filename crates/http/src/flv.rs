// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FLV container muxing for HTTP-FLV egress (component K).
//!
//! An RTMP message's payload is already FLV-tag-shaped (the wire formats
//! share their audio/video tag bytes by design), so muxing is mostly framing:
//! prepend the 11-byte tag header and append the 4-byte previous-tag-size
//! trailer SRS-derived players expect.

use crate::egress::Transmuxer;
use byteorder::{BigEndian, WriteBytesExt};
use rtmpkit_core::types::{Message, MessageType};

const TAG_TYPE_AUDIO: u8 = 8;
const TAG_TYPE_VIDEO: u8 = 9;
const TAG_TYPE_SCRIPT: u8 = 18;

pub struct FlvMuxer {
    has_video: bool,
    has_audio: bool,
}

impl FlvMuxer {
    #[must_use]
    pub const fn new(has_audio: bool, has_video: bool) -> Self {
        Self { has_audio, has_video }
    }

    fn tag(tag_type: u8, timestamp_ms: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(15 + payload.len());
        out.push(tag_type);
        write_u24(&mut out, payload.len() as u32);
        write_u24(&mut out, timestamp_ms & 0x00FF_FFFF);
        out.push(((timestamp_ms >> 24) & 0xFF) as u8);
        write_u24(&mut out, 0); // stream id, always 0
        out.extend_from_slice(payload);
        let _ = out.write_u32::<BigEndian>(11 + payload.len() as u32);
        out
    }
}

fn write_u24(out: &mut Vec<u8>, v: u32) {
    out.push(((v >> 16) & 0xFF) as u8);
    out.push(((v >> 8) & 0xFF) as u8);
    out.push((v & 0xFF) as u8);
}

impl Transmuxer for FlvMuxer {
    fn content_type(&self) -> &'static str {
        "video/x-flv"
    }

    fn header(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.has_audio {
            flags |= 0x04;
        }
        if self.has_video {
            flags |= 0x01;
        }
        let mut out = vec![b'F', b'L', b'V', 1, flags, 0, 0, 0, 9];
        let _ = out.write_u32::<BigEndian>(0); // PreviousTagSize0
        out
    }

    fn write_audio(&mut self, msg: &Message) -> Vec<u8> {
        Self::tag(TAG_TYPE_AUDIO, msg.timestamp_ms, &msg.payload)
    }

    fn write_video(&mut self, msg: &Message) -> Vec<u8> {
        Self::tag(TAG_TYPE_VIDEO, msg.timestamp_ms, &msg.payload)
    }

    fn write_metadata(&mut self, msg: &Message) -> Vec<u8> {
        Self::tag(TAG_TYPE_SCRIPT, msg.timestamp_ms, &msg.payload)
    }
}

#[must_use]
pub fn message_kind(msg_type: MessageType) -> Option<&'static str> {
    match msg_type {
        MessageType::Audio => Some("audio"),
        MessageType::Video => Some("video"),
        MessageType::Amf0Data | MessageType::Amf3Data => Some("metadata"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_header_flags_reflect_has_audio_and_video() {
        let muxer = FlvMuxer::new(true, true);
        let header = muxer.header();
        assert_eq!(&header[0..3], b"FLV");
        assert_eq!(header[4], 0x05);
    }

    #[test]
    fn test_video_tag_has_previous_tag_size_trailer() {
        let mut muxer = FlvMuxer::new(false, true);
        let msg = Message::new(MessageType::Video, 42, 1, Bytes::from_static(&[0x27, 1, 0, 0, 0]));
        let tag = muxer.write_video(&msg);
        assert_eq!(tag[0], TAG_TYPE_VIDEO);
        let data_size = u32::from(tag[1]) << 16 | u32::from(tag[2]) << 8 | u32::from(tag[3]);
        assert_eq!(data_size, 5);
        let trailer = u32::from_be_bytes([tag[tag.len() - 4], tag[tag.len() - 3], tag[tag.len() - 2], tag[tag.len() - 1]]);
        assert_eq!(trailer, 11 + 5);
    }
}
