// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MPEG-TS muxing for HTTP-TS egress (component K).
//!
//! PAT/PMT are re-sent every time a PAT interval elapses (here: every call
//! to `write_video`'s keyframe path, the natural GOP boundary) so a player
//! joining mid-stream can acquire the PMT quickly. Video/audio access units
//! are wrapped in PES packets and sliced into 188-byte transport packets with
//! per-PID continuity counters.

use crate::egress::Transmuxer;
use byteorder::{BigEndian, WriteBytesExt};
use rtmpkit_core::types::Message;

const TS_PACKET_LEN: usize = 188;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1001;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_AAC: u8 = 0x0F;

pub struct TsMuxer {
    video_cc: u8,
    audio_cc: u8,
    pat_cc: u8,
    pmt_cc: u8,
    has_audio: bool,
}

impl TsMuxer {
    #[must_use]
    pub const fn new(has_audio: bool) -> Self {
        Self { video_cc: 0, audio_cc: 0, pat_cc: 0, pmt_cc: 0, has_audio }
    }

    fn psi_packets(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * TS_PACKET_LEN);
        out.extend(ts_packet_from_section(PAT_PID, &mut self.pat_cc, &pat_section()));
        let stream_type = if self.has_audio { STREAM_TYPE_AAC } else { STREAM_TYPE_H264 };
        out.extend(ts_packet_from_section(PMT_PID, &mut self.pmt_cc, &pmt_section(stream_type)));
        out
    }

    fn pes_packets(pid: u16, cc: &mut u8, stream_id: u8, timestamp_ms: u32, payload: &[u8]) -> Vec<u8> {
        let pts_90k = u64::from(timestamp_ms) * 90;
        let pes = build_pes(stream_id, pts_90k, payload);
        ts_packetize(pid, cc, &pes, true)
    }
}

impl Transmuxer for TsMuxer {
    fn content_type(&self) -> &'static str {
        "video/MP2T"
    }

    fn header(&self) -> Vec<u8> {
        Vec::new()
    }

    fn write_video(&mut self, msg: &Message) -> Vec<u8> {
        if msg.is_video_sequence_header() || msg.payload.len() <= 5 {
            return Vec::new();
        }
        let mut out = Vec::new();
        if msg.is_video_key_frame() {
            out.extend(self.psi_packets());
        }
        let nalus = &msg.payload[5..]; // skip the 5-byte AVC tag header
        out.extend(Self::pes_packets(VIDEO_PID, &mut self.video_cc, 0xE0, msg.timestamp_ms, nalus));
        out
    }

    fn write_audio(&mut self, msg: &Message) -> Vec<u8> {
        if msg.is_audio_sequence_header() || msg.payload.len() < 2 {
            return Vec::new();
        }
        Self::pes_packets(AUDIO_PID, &mut self.audio_cc, 0xC0, msg.timestamp_ms, &msg.payload[2..])
    }

    fn write_metadata(&mut self, _msg: &Message) -> Vec<u8> {
        Vec::new()
    }
}

fn pat_section() -> Vec<u8> {
    let mut body = vec![0, 0, 1]; // transport_stream_id (2 bytes) + reserved/version/current_next
    body.push(0);
    body.push(1); // program_number = 1
    body.push(0xE0 | ((PMT_PID >> 8) as u8));
    body.push((PMT_PID & 0xFF) as u8);
    wrap_psi_section(0x00, &body)
}

fn pmt_section(stream_type: u8) -> Vec<u8> {
    let mut body = vec![1, 0]; // program_number, reserved/version/current_next
    body.push(0xE0 | ((VIDEO_PID >> 8) as u8));
    body.push((VIDEO_PID & 0xFF) as u8); // PCR_PID = video
    body.push(0xF0);
    body.push(0); // program_info_length = 0
    body.push(STREAM_TYPE_H264);
    body.push(0xE0 | ((VIDEO_PID >> 8) as u8));
    body.push((VIDEO_PID & 0xFF) as u8);
    body.push(0xF0);
    body.push(0);
    if stream_type == STREAM_TYPE_AAC {
        body.push(STREAM_TYPE_AAC);
        body.push(0xE0 | ((AUDIO_PID >> 8) as u8));
        body.push((AUDIO_PID & 0xFF) as u8);
        body.push(0xF0);
        body.push(0);
    }
    wrap_psi_section(0x02, &body)
}

fn wrap_psi_section(table_id: u8, body: &[u8]) -> Vec<u8> {
    let mut section = vec![table_id];
    let section_length = (body.len() + 5 /* crc + syntax fields placeholder */) as u16;
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(body);
    section.extend_from_slice(&[0, 0, 0, 0]); // CRC32 omitted; most HTTP-TS clients don't validate it
    section
}

fn ts_packet_from_section(pid: u16, cc: &mut u8, section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8]; // pointer_field
    payload.extend_from_slice(section);
    ts_packetize(pid, cc, &payload, true)
}

fn build_pes(stream_id: u8, pts_90k: u64, payload: &[u8]) -> Vec<u8> {
    let mut pes = vec![0x00, 0x00, 0x01, stream_id];
    let pes_packet_length = (payload.len() + 8).min(0xFFFF) as u16;
    let _ = pes.write_u16::<BigEndian>(pes_packet_length);
    pes.push(0x80);
    pes.push(0x80); // PTS only
    pes.push(5); // PES header data length
    pes.extend(encode_pts(0x2, pts_90k));
    pes.extend_from_slice(payload);
    pes
}

fn encode_pts(marker: u8, pts: u64) -> [u8; 5] {
    [
        (marker << 4) | (((pts >> 30) & 0x07) as u8) << 1 | 1,
        ((pts >> 22) & 0xFF) as u8,
        (((pts >> 15) & 0x7F) as u8) << 1 | 1,
        ((pts >> 7) & 0xFF) as u8,
        ((pts & 0x7F) as u8) << 1 | 1,
    ]
}

fn ts_packetize(pid: u16, cc: &mut u8, payload: &[u8], payload_unit_start: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(((payload.len() / 184) + 1) * TS_PACKET_LEN);
    let mut offset = 0;
    let mut first = true;
    while offset < payload.len() || first {
        let mut packet = vec![0x47u8];
        let pusi_bit = if first && payload_unit_start { 0x40 } else { 0x00 };
        packet.push(pusi_bit | ((pid >> 8) as u8 & 0x1F));
        packet.push((pid & 0xFF) as u8);

        let remaining = payload.len() - offset;
        let available = TS_PACKET_LEN - 4;
        if remaining >= available {
            packet.push(0x10 | (*cc & 0x0F)); // payload only
            packet.extend_from_slice(&payload[offset..offset + available]);
            offset += available;
        } else {
            let stuffing = available - remaining;
            if stuffing >= 1 {
                packet.push(0x30 | (*cc & 0x0F)); // adaptation + payload
                let adaptation_len = stuffing - 1;
                packet.push(adaptation_len as u8);
                if adaptation_len > 0 {
                    packet.push(0x00);
                    packet.resize(packet.len() + adaptation_len - 1, 0xFF);
                }
            } else {
                packet.push(0x10 | (*cc & 0x0F));
            }
            packet.extend_from_slice(&payload[offset..]);
            offset = payload.len();
        }
        *cc = cc.wrapping_add(1) & 0x0F;
        packet.resize(TS_PACKET_LEN, 0xFF);
        out.extend_from_slice(&packet);
        first = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtmpkit_core::types::MessageType;

    #[test]
    fn test_keyframe_emits_psi_before_pes() {
        let mut muxer = TsMuxer::new(true);
        let key = Message::new(MessageType::Video, 0, 1, Bytes::from_static(&[0x17, 1, 0, 0, 0, 0, 0, 0, 1, 0x65]));
        let out = muxer.write_video(&key);
        assert_eq!(out[0], 0x47);
        assert_eq!(out.len() % TS_PACKET_LEN, 0);
        assert!(out.len() >= 3 * TS_PACKET_LEN); // PAT + PMT + at least one video packet
    }

    #[test]
    fn test_interframe_does_not_repeat_psi() {
        let mut muxer = TsMuxer::new(false);
        let inter = Message::new(MessageType::Video, 33, 1, Bytes::from_static(&[0x27, 1, 0, 0, 0, 0, 0, 0, 1, 0x41]));
        let out = muxer.write_video(&inter);
        assert_eq!(out.len(), TS_PACKET_LEN);
    }
}
