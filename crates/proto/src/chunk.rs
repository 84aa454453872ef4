// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Chunk stream multiplexing: basic/message headers, the chunk-id cache,
//! extended timestamps, and the protocol control messages (chunk size, ack
//! window, peer bandwidth, user control events) layered directly on top.
//!
//! Ported from `examples/original_source/protocol_rtmp_stack.{h,cpp}`'s
//! `ChunkStream`/`Protocol` classes. [`ChunkProtocol`] owns both the read and
//! write sides of one connection's chunk multiplexing, auto-responding to
//! acks and pings the way `Protocol::ResponseAcknowledgementMessage` /
//! `ResponsePingMessage` do, so callers only ever see fully reassembled
//! application [`Message`]s.
//!
//! Inbound bytes flow through one [`FastStream`] per connection, so the
//! per-message payload-length check below and `FastStream`'s own 256 KiB
//! cap both bound how much an unfinished message can make the server buffer.

use rtmpkit_core::buffer::{self, FastStream};
use rtmpkit_core::error::{Error, Result};
use rtmpkit_core::types::{Message, MessageType};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const MIN_CHUNK_SIZE: u32 = 128;
const MAX_CHUNK_SIZE: u32 = 65536;
const DEFAULT_CHUNK_SIZE: usize = 128;
const EXTENDED_TIMESTAMP_MARKER: u32 = 0xFF_FFFF;
const FAST_CID_COUNT: usize = 64;

/// Protocol-control message type ids, handled internally by [`ChunkProtocol`]
/// rather than surfaced to the application layer.
mod control_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
}

mod user_control_event {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const STREAM_DRY: u16 = 2;
    pub const SET_BUFFER_LENGTH: u16 = 3;
    pub const STREAM_IS_RECORDED: u16 = 4;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
    pub const FMS_EVENT: u16 = 0x001A;
}

/// A decoded RTMP user-control (event type 4) body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    /// A single-byte FMS-private event (0x1A), data opaque to this layer.
    FmsEvent(u8),
}

struct ChunkState {
    fmt: u8,
    timestamp: u32,
    /// Raw 3-byte timestamp-or-delta field from the last fmt 0/1/2 header on
    /// this chunk-id; reapplied when a fmt-3 chunk reuses the header to start
    /// a new message (`spec.md` §3: "fmt 3 inherits all").
    timestamp_delta: u32,
    payload_length: u32,
    msg_type_id: u8,
    stream_id: u32,
    /// Whether this chunk-id's timestamp field is currently in extended-ts
    /// mode (set on fmt 0/1/2 whenever the 24-bit field is `0xFFFFFF`),
    /// persisted so fmt-3 continuations know to read/probe the 4 extra bytes.
    extended_timestamp: bool,
    partial: Vec<u8>,
    msg_count: u64,
}

impl ChunkState {
    fn fresh() -> Self {
        Self {
            fmt: 0,
            timestamp: 0,
            timestamp_delta: 0,
            payload_length: 0,
            msg_type_id: 0,
            stream_id: 0,
            extended_timestamp: false,
            partial: Vec::new(),
            msg_count: 0,
        }
    }
}

/// Per-chunk-stream-id cache: a fixed-size fast path for `cid < 64` (the
/// overwhelming majority of traffic — audio/video/command chunk ids are all
/// small), falling back to a map for the rare larger ids.
#[derive(Default)]
struct ChunkIdCache {
    fast: Vec<Option<ChunkState>>,
    overflow: HashMap<u32, ChunkState>,
}

impl ChunkIdCache {
    fn new() -> Self {
        let mut fast = Vec::with_capacity(FAST_CID_COUNT);
        fast.resize_with(FAST_CID_COUNT, || None);
        Self { fast, overflow: HashMap::new() }
    }

    fn entry(&mut self, cid: u32) -> &mut ChunkState {
        if (cid as usize) < FAST_CID_COUNT {
            self.fast[cid as usize].get_or_insert_with(ChunkState::fresh)
        } else {
            self.overflow.entry(cid).or_insert_with(ChunkState::fresh)
        }
    }
}

fn cid_basic_header_size(cid: u32) -> usize {
    if cid <= 63 {
        1
    } else if cid <= 319 {
        2
    } else {
        3
    }
}

async fn write_basic_header<W: AsyncWrite + Unpin>(out: &mut W, fmt: u8, cid: u32) -> Result<()> {
    match cid_basic_header_size(cid) {
        1 => out.write_u8((fmt << 6) | cid as u8).await?,
        2 => {
            out.write_u8(fmt << 6).await?;
            out.write_u8((cid - 64) as u8).await?;
        },
        _ => {
            out.write_u8((fmt << 6) | 1).await?;
            let rest = cid - 64;
            out.write_u8((rest & 0xff) as u8).await?;
            out.write_u8((rest >> 8) as u8).await?;
        },
    }
    Ok(())
}

/// Reads a basic header through `buf`, growing it from `reader` as needed so
/// the cid-width probe (byte 1's low 6 bits) and the header itself share one
/// read-ahead cache with the rest of the chunk protocol.
async fn read_basic_header<R: AsyncRead + Unpin>(buf: &mut FastStream, reader: &mut R) -> Result<(u8, u32)> {
    buf.grow(reader, 1).await?;
    let first = buf.read_slice(1)[0];
    let fmt = first >> 6;
    let low6 = first & 0x3f;
    let cid = match low6 {
        0 => {
            buf.grow(reader, 1).await?;
            64 + u32::from(buf.read_slice(1)[0])
        },
        1 => {
            buf.grow(reader, 2).await?;
            let rest = buf.read_slice(2);
            64 + u32::from(rest[0]) + (u32::from(rest[1]) << 8)
        },
        other => u32::from(other),
    };
    Ok((fmt, cid))
}

fn write_u24_be(out: &mut Vec<u8>, value: u32) {
    out.push(((value >> 16) & 0xff) as u8);
    out.push(((value >> 8) & 0xff) as u8);
    out.push((value & 0xff) as u8);
}

/// One side of one connection's chunk multiplexing: reassembles incoming
/// chunks into [`Message`]s (auto-handling protocol control messages along
/// the way) and fragments outgoing messages into chunks.
pub struct ChunkProtocol<S> {
    stream: S,
    /// Read-ahead cache every inbound byte (basic header, message header,
    /// extended timestamp, payload) flows through; also the sole enforcer of
    /// the `spec.md` §4.A 256 KiB resource bound on a single `grow`.
    in_buf: FastStream,
    cache: ChunkIdCache,
    in_chunk_size: usize,
    out_chunk_size: usize,
    recv_bytes: u64,
    last_acked: u64,
    in_ack_window: u32,
    /// When set, `Ack`/`PingResponse` are produced inline during
    /// `recv_message`; when unset the caller must send them explicitly.
    pub auto_response: bool,
}

impl<S> ChunkProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            in_buf: FastStream::new(),
            cache: ChunkIdCache::new(),
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            recv_bytes: 0,
            last_acked: 0,
            in_ack_window: 0,
            auto_response: true,
        }
    }

    #[must_use]
    pub fn in_chunk_size(&self) -> usize {
        self.in_chunk_size
    }

    #[must_use]
    pub fn out_chunk_size(&self) -> usize {
        self.out_chunk_size
    }

    pub fn set_in_ack_window(&mut self, window: u32) {
        self.in_ack_window = window;
    }

    /// Reads and reassembles the next application message, transparently
    /// handling any protocol control messages (chunk size, window ack size,
    /// peer bandwidth, user control, acknowledgement) that arrive first.
    ///
    /// # Errors
    /// [`Error::Protocol`] on malformed framing (bad chunk size, fresh
    /// chunk-id not starting at fmt 0, payload-length change mid-message).
    /// [`Error::Io`] on a transport failure.
    pub async fn recv_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.recv_one_chunk().await? {
                return Ok(msg);
            }
        }
    }

    /// Reads one chunk, returning a completed [`Message`] if this chunk
    /// finished one, or `None` if it was either a partial fragment or an
    /// internally-handled protocol control message.
    async fn recv_one_chunk(&mut self) -> Result<Option<Message>> {
        let (fmt, cid) = read_basic_header(&mut self.in_buf, &mut self.stream).await?;
        self.recv_bytes += cid_basic_header_size(cid) as u64;

        let is_fresh = self.cache.entry(cid).msg_count == 0;
        if is_fresh && fmt != 0 && fmt != 1 {
            return Err(Error::Protocol(format!("chunk-id {cid} fresh but starts at fmt {fmt}, expected 0")));
        }
        if is_fresh && fmt == 1 {
            tracing::warn!(cid, "fresh chunk-id started at fmt 1 instead of fmt 0, tolerating");
        }

        // A message is "in flight" on this cid iff a prior chunk left a
        // partial payload buffered; a fresh fmt-0 header is only legal
        // between messages, never mid-reassembly (spec.md §3/§4.D step 5).
        let in_flight = !self.cache.entry(cid).partial.is_empty();
        if fmt == 0 && in_flight {
            return Err(Error::Protocol(format!(
                "chunk-id {cid} sent a fresh fmt-0 header while a message was still in flight"
            )));
        }
        let is_first_chunk_of_msg = !in_flight;

        let header_size = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        let header_buf = if header_size > 0 {
            self.in_buf.grow(&mut self.stream, header_size).await?;
            self.in_buf.read_slice(header_size).to_vec()
        } else {
            Vec::new()
        };
        self.recv_bytes += header_size as u64;

        if fmt <= 2 {
            let delta_field =
                (u32::from(header_buf[0]) << 16) | (u32::from(header_buf[1]) << 8) | u32::from(header_buf[2]);
            let state = self.cache.entry(cid);
            state.fmt = fmt;
            state.timestamp_delta = delta_field;
            state.extended_timestamp = delta_field >= EXTENDED_TIMESTAMP_MARKER;
            if !state.extended_timestamp {
                if fmt == 0 {
                    state.timestamp = delta_field;
                } else {
                    state.timestamp = state.timestamp.wrapping_add(delta_field);
                }
            }
            if fmt <= 1 {
                let length =
                    (u32::from(header_buf[3]) << 16) | (u32::from(header_buf[4]) << 8) | u32::from(header_buf[5]);
                if fmt == 1 && !is_first_chunk_of_msg && state.payload_length != length {
                    return Err(Error::Protocol(format!(
                        "chunk-id {cid} changed payload length from {} to {length} mid-message",
                        state.payload_length
                    )));
                }
                if length as usize > buffer::MAX_CAPACITY {
                    return Err(Error::Resource(format!(
                        "message payload length {length} exceeds cap {} bytes",
                        buffer::MAX_CAPACITY
                    )));
                }
                state.payload_length = length;
                state.msg_type_id = header_buf[6];
                if fmt == 0 {
                    state.stream_id = u32::from_le_bytes([header_buf[7], header_buf[8], header_buf[9], header_buf[10]]);
                }
            }
        } else {
            let state = self.cache.entry(cid);
            state.fmt = fmt;
            // fmt 3 inherits the full header; if it's reusing this cid to
            // start a new message (rather than continuing the last one) the
            // stored delta is reapplied, unless extended-ts is in play (that
            // case is resolved below once the 4 probed bytes are in hand).
            if is_first_chunk_of_msg && !state.extended_timestamp {
                state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
            }
        }

        if self.cache.entry(cid).extended_timestamp {
            self.in_buf.grow(&mut self.stream, 4).await?;
            let raw = self.in_buf.read_slice(4);
            let probed = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) & 0x7fff_ffff;
            self.recv_bytes += 4;

            let state = self.cache.entry(cid);
            let running = state.timestamp & 0x7fff_ffff;
            if !is_first_chunk_of_msg && running > 0 && running != probed {
                // This continuation's chunk-id is in extended-ts mode, but
                // these 4 bytes don't match the running timestamp — they're
                // payload, not a timestamp some senders omit on type-3
                // continuations (spec.md §3/§4.D step 4). Rewind and fall
                // through to read them as payload instead.
                self.in_buf.skip(-4);
                self.recv_bytes -= 4;
            } else {
                state.timestamp = probed;
            }
        }

        let state = self.cache.entry(cid);
        state.timestamp &= 0x7fff_ffff;

        if state.partial.is_empty() && state.payload_length == 0 {
            return Err(Error::Protocol(format!("chunk-id {cid} declared zero-length message")));
        }

        let remaining = state.payload_length as usize - state.partial.len();
        let take = remaining.min(self.in_chunk_size);
        self.in_buf.grow(&mut self.stream, take).await?;
        let payload_chunk = self.in_buf.read_slice(take).to_vec();
        self.recv_bytes += take as u64;

        let message_complete = {
            let state = self.cache.entry(cid);
            state.partial.extend_from_slice(&payload_chunk);
            state.msg_count += 1;
            state.partial.len() >= state.payload_length as usize
        };

        self.maybe_send_ack().await?;

        if !message_complete {
            return Ok(None);
        }

        let (payload, msg_type_id, timestamp, stream_id) = {
            let state = self.cache.entry(cid);
            (std::mem::take(&mut state.partial), state.msg_type_id, state.timestamp, state.stream_id)
        };

        if let Some(handled) = self.handle_if_control(msg_type_id, timestamp, &payload).await? {
            let _ = handled;
            return Ok(None);
        }

        let msg_type = MessageType::from_u8(msg_type_id)
            .ok_or_else(|| Error::Protocol(format!("unknown message type id {msg_type_id}")))?;
        Ok(Some(Message::new(msg_type, timestamp, stream_id, payload.into())))
    }

    /// Intercepts and applies protocol control messages, returning `Some(())`
    /// when `msg_type_id` was one of them (so the caller should keep looping
    /// rather than surface a [`Message`]).
    async fn handle_if_control(&mut self, msg_type_id: u8, timestamp: u32, payload: &[u8]) -> Result<Option<()>> {
        match msg_type_id {
            control_type::SET_CHUNK_SIZE => {
                let size = payload
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .ok_or_else(|| Error::Protocol("short SetChunkSize payload".into()))?;
                if size < MIN_CHUNK_SIZE {
                    return Err(Error::Protocol(format!("SetChunkSize {size} below minimum {MIN_CHUNK_SIZE}")));
                }
                if size > MAX_CHUNK_SIZE {
                    tracing::warn!(size, max = MAX_CHUNK_SIZE, "peer requested chunk size above hard max, honoring anyway");
                }
                self.in_chunk_size = size as usize;
                Ok(Some(()))
            },
            control_type::ABORT => Ok(Some(())),
            control_type::ACKNOWLEDGEMENT => Ok(Some(())),
            control_type::WINDOW_ACK_SIZE => {
                let size = payload
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .ok_or_else(|| Error::Protocol("short WindowAckSize payload".into()))?;
                self.in_ack_window = size;
                Ok(Some(()))
            },
            control_type::SET_PEER_BANDWIDTH => Ok(Some(())),
            control_type::USER_CONTROL => {
                if let Some(event) = decode_user_control(payload)? {
                    if self.auto_response {
                        if let UserControlEvent::PingRequest(ts) = event {
                            self.send_user_control(UserControlEvent::PingResponse(ts)).await?;
                        }
                    }
                }
                let _ = timestamp;
                Ok(Some(()))
            },
            _ => Ok(None),
        }
    }

    async fn maybe_send_ack(&mut self) -> Result<()> {
        if !self.auto_response || self.in_ack_window == 0 {
            return Ok(());
        }
        let window = u64::from(self.in_ack_window);
        if self.recv_bytes.saturating_sub(self.last_acked) >= window / 2 {
            let sequence = (self.recv_bytes & u64::from(u32::MAX)) as u32;
            self.send_acknowledgement(sequence).await?;
            self.last_acked = self.recv_bytes;
        }
        Ok(())
    }

    /// Fragments and writes one application message: a type-0 first chunk
    /// using `msg.preferred_chunk_id`, followed by type-3 continuations of
    /// `out_chunk_size` bytes each.
    ///
    /// # Errors
    /// [`Error::Io`] on a transport failure.
    pub async fn send_message(&mut self, msg: &Message) -> Result<()> {
        let cid = msg.preferred_chunk_id;
        let payload = msg.payload.as_ref();

        let mut header = Vec::with_capacity(16);
        write_basic_header_sync(&mut header, 0, cid);
        write_u24_be(&mut header, msg.timestamp_ms.min(EXTENDED_TIMESTAMP_MARKER));
        write_u24_be(&mut header, payload.len() as u32);
        header.push(msg.msg_type as u8);
        header.extend_from_slice(&msg.stream_id.to_le_bytes());
        if msg.timestamp_ms >= EXTENDED_TIMESTAMP_MARKER {
            header.extend_from_slice(&msg.timestamp_ms.to_be_bytes());
        }

        self.stream.write_all(&header).await?;

        let mut offset = 0usize;
        let mut first = true;
        while offset < payload.len() {
            if !first {
                let mut cont_header = Vec::with_capacity(5);
                write_basic_header_sync(&mut cont_header, 3, cid);
                if msg.timestamp_ms >= EXTENDED_TIMESTAMP_MARKER {
                    cont_header.extend_from_slice(&msg.timestamp_ms.to_be_bytes());
                }
                self.stream.write_all(&cont_header).await?;
            }
            let take = (payload.len() - offset).min(self.out_chunk_size);
            self.stream.write_all(&payload[offset..offset + take]).await?;
            offset += take;
            first = false;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// # Errors
    /// [`Error::Protocol`] if `size` is below the protocol minimum.
    pub async fn send_set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size < MIN_CHUNK_SIZE {
            return Err(Error::Protocol(format!("refusing to set chunk size below {MIN_CHUNK_SIZE}")));
        }
        if size > MAX_CHUNK_SIZE {
            tracing::warn!(size, max = MAX_CHUNK_SIZE, "setting chunk size above hard max");
        }
        self.send_control(control_type::SET_CHUNK_SIZE, &size.to_be_bytes()).await?;
        self.out_chunk_size = size as usize;
        Ok(())
    }

    /// # Errors
    /// [`Error::Io`] on a transport failure.
    pub async fn send_window_ack_size(&mut self, size: u32) -> Result<()> {
        self.send_control(control_type::WINDOW_ACK_SIZE, &size.to_be_bytes()).await
    }

    /// # Errors
    /// [`Error::Io`] on a transport failure.
    pub async fn send_acknowledgement(&mut self, sequence: u32) -> Result<()> {
        self.send_control(control_type::ACKNOWLEDGEMENT, &sequence.to_be_bytes()).await
    }

    /// # Errors
    /// [`Error::Io`] on a transport failure.
    pub async fn send_set_peer_bandwidth(&mut self, bandwidth: u32, limit_type: u8) -> Result<()> {
        let mut payload = bandwidth.to_be_bytes().to_vec();
        payload.push(limit_type);
        self.send_control(control_type::SET_PEER_BANDWIDTH, &payload).await
    }

    /// # Errors
    /// [`Error::Io`] on a transport failure.
    pub async fn send_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        let payload = encode_user_control(event);
        self.send_control(control_type::USER_CONTROL, &payload).await
    }

    async fn send_control(&mut self, msg_type_id: u8, payload: &[u8]) -> Result<()> {
        let mut header = Vec::with_capacity(12 + payload.len());
        write_basic_header_sync(&mut header, 0, 2);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, payload.len() as u32);
        header.push(msg_type_id);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(payload);
        self.stream.write_all(&header).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn write_basic_header_sync(out: &mut Vec<u8>, fmt: u8, cid: u32) {
    match cid_basic_header_size(cid) {
        1 => out.push((fmt << 6) | cid as u8),
        2 => {
            out.push(fmt << 6);
            out.push((cid - 64) as u8);
        },
        _ => {
            out.push((fmt << 6) | 1);
            let rest = cid - 64;
            out.push((rest & 0xff) as u8);
            out.push((rest >> 8) as u8);
        },
    }
}

fn decode_user_control(payload: &[u8]) -> Result<Option<UserControlEvent>> {
    if payload.len() < 2 {
        return Err(Error::Protocol("short user-control event-type field".into()));
    }
    let event_type = u16::from_be_bytes([payload[0], payload[1]]);
    let body = &payload[2..];
    let u32_at = |b: &[u8]| -> Result<u32> {
        b.get(..4)
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
            .ok_or_else(|| Error::Protocol("short user-control body".into()))
    };
    let event = match event_type {
        user_control_event::STREAM_BEGIN => UserControlEvent::StreamBegin(u32_at(body)?),
        user_control_event::STREAM_EOF => UserControlEvent::StreamEof(u32_at(body)?),
        user_control_event::STREAM_DRY => UserControlEvent::StreamDry(u32_at(body)?),
        user_control_event::SET_BUFFER_LENGTH => {
            UserControlEvent::SetBufferLength { stream_id: u32_at(body)?, buffer_ms: u32_at(&body[4..])? }
        },
        user_control_event::STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(u32_at(body)?),
        user_control_event::PING_REQUEST => UserControlEvent::PingRequest(u32_at(body)?),
        user_control_event::PING_RESPONSE => UserControlEvent::PingResponse(u32_at(body)?),
        user_control_event::FMS_EVENT => {
            UserControlEvent::FmsEvent(*body.first().ok_or_else(|| Error::Protocol("empty FMS event body".into()))?)
        },
        other => {
            tracing::debug!(event_type = other, "ignoring unrecognized user-control event");
            return Ok(None);
        },
    };
    Ok(Some(event))
}

fn encode_user_control(event: UserControlEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    match event {
        UserControlEvent::StreamBegin(id) => {
            out.extend_from_slice(&user_control_event::STREAM_BEGIN.to_be_bytes());
            out.extend_from_slice(&id.to_be_bytes());
        },
        UserControlEvent::StreamEof(id) => {
            out.extend_from_slice(&user_control_event::STREAM_EOF.to_be_bytes());
            out.extend_from_slice(&id.to_be_bytes());
        },
        UserControlEvent::StreamDry(id) => {
            out.extend_from_slice(&user_control_event::STREAM_DRY.to_be_bytes());
            out.extend_from_slice(&id.to_be_bytes());
        },
        UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
            out.extend_from_slice(&user_control_event::SET_BUFFER_LENGTH.to_be_bytes());
            out.extend_from_slice(&stream_id.to_be_bytes());
            out.extend_from_slice(&buffer_ms.to_be_bytes());
        },
        UserControlEvent::StreamIsRecorded(id) => {
            out.extend_from_slice(&user_control_event::STREAM_IS_RECORDED.to_be_bytes());
            out.extend_from_slice(&id.to_be_bytes());
        },
        UserControlEvent::PingRequest(ts) => {
            out.extend_from_slice(&user_control_event::PING_REQUEST.to_be_bytes());
            out.extend_from_slice(&ts.to_be_bytes());
        },
        UserControlEvent::PingResponse(ts) => {
            out.extend_from_slice(&user_control_event::PING_RESPONSE.to_be_bytes());
            out.extend_from_slice(&ts.to_be_bytes());
        },
        UserControlEvent::FmsEvent(byte) => {
            out.extend_from_slice(&user_control_event::FMS_EVENT.to_be_bytes());
            out.push(byte);
        },
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::duplex;

    #[test]
    fn test_cid_basic_header_size_table() {
        assert_eq!(cid_basic_header_size(2), 1);
        assert_eq!(cid_basic_header_size(63), 1);
        assert_eq!(cid_basic_header_size(64), 2);
        assert_eq!(cid_basic_header_size(319), 2);
        assert_eq!(cid_basic_header_size(320), 3);
        assert_eq!(cid_basic_header_size(65599), 3);
    }

    #[tokio::test]
    async fn test_basic_header_roundtrip_all_widths() {
        for cid in [2u32, 63, 64, 319, 320, 65599] {
            let (mut client, mut server) = duplex(64);
            write_basic_header(&mut client, 1, cid).await.unwrap();
            client.flush().await.unwrap();
            let mut buf = FastStream::new();
            let (fmt, read_cid) = read_basic_header(&mut buf, &mut server).await.unwrap();
            assert_eq!(fmt, 1);
            assert_eq!(read_cid, cid);
        }
    }

    #[tokio::test]
    async fn test_send_then_recv_small_message() {
        let (client, server) = duplex(4096);
        let mut writer = ChunkProtocol::new(client);
        let mut reader = ChunkProtocol::new(server);

        let msg = Message::new(MessageType::Amf0Command, 0, 1, Bytes::from_static(b"hello"));
        let write_task = tokio::spawn(async move {
            writer.send_message(&msg).await.unwrap();
            writer
        });
        let received = reader.recv_message().await.unwrap();
        assert_eq!(received.payload.as_ref(), b"hello");
        assert_eq!(received.msg_type, MessageType::Amf0Command);
        let _ = write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_larger_than_chunk_size_fragments_and_reassembles() {
        let (client, server) = duplex(1 << 16);
        let mut writer = ChunkProtocol::new(client);
        writer.out_chunk_size = 16;
        let mut reader = ChunkProtocol::new(server);
        reader.in_chunk_size = 16;

        let payload = vec![0xABu8; 100];
        let msg = Message::new(MessageType::Video, 1000, 5, Bytes::from(payload.clone()));
        let write_task = tokio::spawn(async move {
            writer.send_message(&msg).await.unwrap();
        });
        let received = reader.recv_message().await.unwrap();
        assert_eq!(received.payload.as_ref(), payload.as_slice());
        assert_eq!(received.timestamp_ms, 1000);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_chunk_size_is_intercepted_and_applied() {
        let (client, server) = duplex(4096);
        let mut writer = ChunkProtocol::new(client);
        let mut reader = ChunkProtocol::new(server);

        let write_task = tokio::spawn(async move {
            writer.send_set_chunk_size(4096).await.unwrap();
            let msg = Message::new(MessageType::Amf0Command, 0, 1, Bytes::from_static(b"x"));
            writer.send_message(&msg).await.unwrap();
        });
        let received = reader.recv_message().await.unwrap();
        assert_eq!(reader.in_chunk_size(), 4096);
        assert_eq!(received.payload.as_ref(), b"x");
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_chunk_size_below_minimum_is_rejected_on_send() {
        let (client, _server) = duplex(64);
        let mut writer = ChunkProtocol::new(client);
        let err = writer.send_set_chunk_size(10).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_user_control_ping_request_triggers_auto_ping_response() {
        let (mut client, server) = duplex(4096);
        let mut receiver = ChunkProtocol::new(server);

        let payload = encode_user_control(UserControlEvent::PingRequest(42));
        let mut header = Vec::new();
        write_basic_header_sync(&mut header, 0, 2);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, payload.len() as u32);
        header.push(control_type::USER_CONTROL);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&payload);
        client.write_all(&header).await.unwrap();
        client.flush().await.unwrap();

        // The ping request is swallowed (no application message produced);
        // the auto PingResponse write happens inline and doesn't block
        // because the duplex buffer absorbs it without a reader.
        let result = receiver.recv_one_chunk().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_window_ack_size_updates_in_ack_window() {
        let (mut client, server) = duplex(4096);
        let mut receiver = ChunkProtocol::new(server);

        let payload = 5_000_000u32.to_be_bytes();
        let mut header = Vec::new();
        write_basic_header_sync(&mut header, 0, 2);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, 4);
        header.push(control_type::WINDOW_ACK_SIZE);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&payload);
        client.write_all(&header).await.unwrap();
        client.flush().await.unwrap();

        let result = receiver.recv_one_chunk().await.unwrap();
        assert!(result.is_none());
        assert_eq!(receiver.in_ack_window, 5_000_000);
    }

    #[tokio::test]
    async fn test_extended_timestamp_message_fragments_and_reassembles_without_corruption() {
        let (client, server) = duplex(1 << 16);
        let mut writer = ChunkProtocol::new(client);
        writer.out_chunk_size = 16;
        let mut reader = ChunkProtocol::new(server);
        reader.in_chunk_size = 16;

        // timestamp >= the marker forces an extended-timestamp field on the
        // first chunk *and*, per send_message, on every type-3 continuation.
        let payload = vec![0xCDu8; 64];
        let msg = Message::new(MessageType::Video, 0x0100_0000, 7, Bytes::from(payload.clone()));
        let write_task = tokio::spawn(async move {
            writer.send_message(&msg).await.unwrap();
        });
        let received = reader.recv_message().await.unwrap();
        assert_eq!(received.payload.as_ref(), payload.as_slice());
        assert_eq!(received.timestamp_ms, 0x0100_0000);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fmt0_header_while_message_in_flight_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        let mut receiver = ChunkProtocol::new(server);
        receiver.in_chunk_size = 16;

        let mut header = Vec::new();
        write_basic_header_sync(&mut header, 0, 4);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, 200);
        header.push(MessageType::Video as u8);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&[0xAAu8; 16]);
        client.write_all(&header).await.unwrap();
        client.flush().await.unwrap();

        assert!(receiver.recv_one_chunk().await.unwrap().is_none());

        let mut second_header = Vec::new();
        write_basic_header_sync(&mut second_header, 0, 4);
        write_u24_be(&mut second_header, 0);
        write_u24_be(&mut second_header, 200);
        second_header.push(MessageType::Video as u8);
        second_header.extend_from_slice(&0u32.to_le_bytes());
        client.write_all(&second_header).await.unwrap();
        client.flush().await.unwrap();

        let err = receiver.recv_one_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_fmt1_payload_length_change_mid_message_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        let mut receiver = ChunkProtocol::new(server);
        receiver.in_chunk_size = 16;

        let mut header = Vec::new();
        write_basic_header_sync(&mut header, 0, 5);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, 200);
        header.push(MessageType::Video as u8);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&[0xAAu8; 16]);
        client.write_all(&header).await.unwrap();
        client.flush().await.unwrap();
        assert!(receiver.recv_one_chunk().await.unwrap().is_none());

        let mut fmt1_header = Vec::new();
        write_basic_header_sync(&mut fmt1_header, 1, 5);
        write_u24_be(&mut fmt1_header, 10);
        write_u24_be(&mut fmt1_header, 50);
        fmt1_header.push(MessageType::Video as u8);
        client.write_all(&fmt1_header).await.unwrap();
        client.flush().await.unwrap();

        let err = receiver.recv_one_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_payload_length_over_resource_cap_is_rejected() {
        let (mut client, server) = duplex(4096);
        let mut receiver = ChunkProtocol::new(server);

        let oversized = (buffer::MAX_CAPACITY + 1) as u32;
        let mut header = Vec::new();
        write_basic_header_sync(&mut header, 0, 6);
        write_u24_be(&mut header, 0);
        write_u24_be(&mut header, oversized);
        header.push(MessageType::Video as u8);
        header.extend_from_slice(&0u32.to_le_bytes());
        client.write_all(&header).await.unwrap();
        client.flush().await.unwrap();

        let err = receiver.recv_one_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
