// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Audio-only egress: raw AAC (ADTS-framed) and raw MP3, both bodyless
//! containers. Grounded in `spec.md` §4.K: "MP3 and AAC-only egress use an
//! encoder-side cache... the first ~N ms of audio are buffered at mount time
//! and re-played to each new consumer" — that cache is
//! [`crate::egress::AudioTapRegistry`], not here; these transmuxers only
//! reshape one message at a time.

use crate::egress::Transmuxer;
use rtmpkit_core::types::Message;

/// AAC sequence header payload layout (after the 2-byte RTMP AAC tag
/// header): `AudioSpecificConfig`, 2 bytes, carrying sample-rate and channel
/// config indices needed to synthesize ADTS headers for raw frames.
pub struct AacMuxer {
    sample_rate_index: u8,
    channel_config: u8,
}

impl AacMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self { sample_rate_index: 4, channel_config: 2 } // 44.1kHz stereo until a sequence header arrives
    }

    fn adts_header(&self, frame_len: usize) -> [u8; 7] {
        let total_len = (frame_len + 7) as u16;
        [
            0xFF,
            0xF1, // MPEG-4, no CRC
            0x40 | (self.sample_rate_index << 2) | (self.channel_config >> 2),
            ((self.channel_config & 0x3) << 6) | ((total_len >> 11) as u8),
            (total_len >> 3) as u8,
            ((total_len & 0x7) as u8) << 5 | 0x1F,
            0xFC,
        ]
    }
}

impl Default for AacMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmuxer for AacMuxer {
    fn content_type(&self) -> &'static str {
        "audio/aac"
    }

    fn header(&self) -> Vec<u8> {
        Vec::new()
    }

    fn write_audio(&mut self, msg: &Message) -> Vec<u8> {
        if msg.payload.len() < 2 {
            return Vec::new();
        }
        if msg.is_audio_sequence_header() {
            if msg.payload.len() >= 4 {
                let config = u16::from_be_bytes([msg.payload[2], msg.payload[3]]);
                self.sample_rate_index = ((config >> 7) & 0x0F) as u8;
                self.channel_config = ((config >> 3) & 0x0F) as u8;
            }
            return Vec::new();
        }
        let raw = &msg.payload[2..];
        let mut out = Vec::with_capacity(7 + raw.len());
        out.extend_from_slice(&self.adts_header(raw.len()));
        out.extend_from_slice(raw);
        out
    }

    fn write_video(&mut self, _msg: &Message) -> Vec<u8> {
        Vec::new()
    }

    fn write_metadata(&mut self, _msg: &Message) -> Vec<u8> {
        Vec::new()
    }
}

/// Raw MP3: the RTMP audio tag body for an MP3 frame is already a complete
/// MPEG frame, so this transmuxer is pure passthrough.
pub struct Mp3Muxer;

impl Transmuxer for Mp3Muxer {
    fn content_type(&self) -> &'static str {
        "audio/mpeg"
    }

    fn header(&self) -> Vec<u8> {
        Vec::new()
    }

    fn write_audio(&mut self, msg: &Message) -> Vec<u8> {
        if msg.payload.len() < 2 {
            return Vec::new();
        }
        msg.payload[1..].to_vec()
    }

    fn write_video(&mut self, _msg: &Message) -> Vec<u8> {
        Vec::new()
    }

    fn write_metadata(&mut self, _msg: &Message) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtmpkit_core::types::MessageType;

    #[test]
    fn test_aac_sequence_header_is_absorbed_not_emitted() {
        let mut muxer = AacMuxer::new();
        let sh = Message::new(MessageType::Audio, 0, 1, Bytes::from_static(&[0xAF, 0, 0x12, 0x10]));
        assert!(muxer.write_audio(&sh).is_empty());
    }

    #[test]
    fn test_aac_raw_frame_gets_adts_header() {
        let mut muxer = AacMuxer::new();
        let frame = Message::new(MessageType::Audio, 10, 1, Bytes::from_static(&[0xAF, 1, 0xDE, 0xAD]));
        let out = muxer.write_audio(&frame);
        assert_eq!(out.len(), 7 + 2);
        assert_eq!(out[0], 0xFF);
        assert_eq!(&out[7..], &[0xDE, 0xAD]);
    }

    #[test]
    fn test_mp3_is_passthrough_minus_tag_byte() {
        let mut muxer = Mp3Muxer;
        let frame = Message::new(MessageType::Audio, 0, 1, Bytes::from_static(&[0x2F, 0xFF, 0xFB, 0x90]));
        assert_eq!(muxer.write_audio(&frame), vec![0xFF, 0xFB, 0x90]);
    }
}
