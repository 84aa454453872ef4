// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! RtmpKit Proto — the RTMP wire protocol layered bottom-up:
//!
//! - [`amf0`]: the AMF0 value codec underlying both [`command`] and data messages.
//! - [`handshake`]: the simple and complex (schema0/1 digest) C0/C1/C2 ↔ S0/S1/S2 exchange.
//! - [`chunk`]: chunk-stream multiplexing — basic/message headers, the chunk-id cache, acks.
//! - [`command`]: the AMF0 command/data [`command::Packet`] taxonomy carried over chunk streams.

pub mod amf0;
pub mod chunk;
pub mod command;
pub mod handshake;
