// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! RtmpKit HTTP — hand-rolled request/response framing plus live FLV/TS/AAC/MP3
//! egress built directly on top of the framing layer (`spec.md` §4.K, §4.L).
//! No general-purpose HTTP server crate sits underneath this: egress
//! connections want direct control over chunk framing and vectored writes.

pub mod audio;
pub mod egress;
pub mod flv;
pub mod framing;
pub mod ts;

pub use egress::{
    AudioReplayCache, AudioTapRegistry, ContainerKind, EgressHooks, LiveEntry, MountRegistry, MountTemplate, Transmuxer,
    DEFAULT_AUDIO_REPLAY_SPAN_MS,
};
pub use framing::{read_body, read_request_head, sniff_content_type, RequestHead, ResponseWriter};
