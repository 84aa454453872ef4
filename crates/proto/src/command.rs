// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! AMF0 command/data packets carried over chunk streams.
//!
//! Ported from `examples/original_source/protocol_rtmp_stack.h`'s `Packet`
//! hierarchy (`ConnectAppPacket`, `PlayPacket`, `FMLEStartPacket`, ...): one
//! class per command there becomes one variant of the [`Packet`] sum type
//! here, per this system's rule against virtual-dispatch hierarchies for a
//! closed, wire-defined set of shapes.

use crate::amf0::{self, Amf0Object, Amf0Value};
use rtmpkit_core::error::{Error, Result};
use rtmpkit_core::types::Message;
use std::collections::HashMap;
use std::io::Cursor;

/// `onStatus`/`_result` info-object status codes, verbatim from the RTMP
/// reference flows.
pub mod status_code {
    pub const CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
    pub const CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";
    pub const STREAM_RESET: &str = "NetStream.Play.Reset";
    pub const STREAM_START: &str = "NetStream.Play.Start";
    pub const STREAM_PAUSE: &str = "NetStream.Pause.Notify";
    pub const STREAM_UNPAUSE: &str = "NetStream.Unpause.Notify";
    pub const PUBLISH_START: &str = "NetStream.Publish.Start";
    pub const DATA_START: &str = "NetStream.Data.Start";
    pub const UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
}

mod command_name {
    pub const CONNECT: &str = "connect";
    pub const CREATE_STREAM: &str = "createStream";
    pub const CLOSE_STREAM: &str = "closeStream";
    pub const PLAY: &str = "play";
    pub const PAUSE: &str = "pause";
    pub const ON_BW_DONE: &str = "onBWDone";
    pub const ON_STATUS: &str = "onStatus";
    pub const RESULT: &str = "_result";
    pub const ERROR: &str = "_error";
    pub const RELEASE_STREAM: &str = "releaseStream";
    pub const FC_PUBLISH: &str = "FCPublish";
    pub const FC_UNPUBLISH: &str = "FCUnpublish";
    pub const PUBLISH: &str = "publish";
    pub const SAMPLE_ACCESS: &str = "|RtmpSampleAccess";
    pub const ON_FC_PUBLISH: &str = "onFCPublish";
    pub const ON_FC_UNPUBLISH: &str = "onFCUnpublish";
}

/// The closed set of AMF0 command/data shapes this system sends or
/// understands. `Unknown` preserves anything else verbatim so the identify
/// FSM can still inspect its command name and arguments (e.g. to answer
/// arbitrary `call` probes like `_checkbw`).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ConnectApp { tc_url: String, app: String, flash_ver: String, swf_url: String, page_url: String, object_encoding: f64, args: Option<Amf0Object> },
    ConnectAppRes { props: Amf0Object, info: Amf0Object },
    Call { transaction_id: f64, command_name: String, args: Vec<Amf0Value> },
    CallRes { transaction_id: f64, args: Vec<Amf0Value> },
    CreateStream { transaction_id: f64 },
    CreateStreamRes { transaction_id: f64, stream_id: f64 },
    CloseStream { transaction_id: f64 },
    ReleaseStream { transaction_id: f64, stream_name: String },
    ReleaseStreamRes { transaction_id: f64 },
    FcPublish { transaction_id: f64, stream_name: String },
    FcPublishRes { transaction_id: f64 },
    FcUnpublish { transaction_id: f64, stream_name: String },
    FcUnpublishRes { transaction_id: f64 },
    Publish { transaction_id: f64, stream_name: String, publish_type: String },
    Play { transaction_id: f64, stream_name: String, start: f64, duration: f64, reset: bool },
    Pause { transaction_id: f64, paused: bool, ms: f64 },
    OnStatusCall { transaction_id: f64, data: Amf0Object },
    OnStatusData { data: Amf0Object },
    OnFcPublish { data: Amf0Object },
    OnFcUnpublish { data: Amf0Object },
    OnBwDone,
    SampleAccess { video: bool, audio: bool },
    OnMetaData { data: Amf0Object },
    Unknown { command_name: String, transaction_id: f64, values: Vec<Amf0Value> },
}

fn read_all(cursor: &mut Cursor<&[u8]>) -> Vec<Amf0Value> {
    let mut values = Vec::new();
    while (cursor.position() as usize) < cursor.get_ref().len() {
        match amf0::read_any(cursor) {
            Ok(v) => values.push(v),
            Err(_) => break,
        }
    }
    values
}

fn object_of(v: &Amf0Value) -> Amf0Object {
    v.as_object().cloned().unwrap_or_default()
}

fn string_field(obj: &Amf0Object, key: &str) -> String {
    obj.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.as_str()).unwrap_or("").to_string()
}

fn number_field(obj: &Amf0Object, key: &str) -> f64 {
    obj.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.as_f64()).unwrap_or(0.0)
}

/// Decodes an AMF0 or AMF3 command/data [`Message`] into a [`Packet`].
///
/// AMF3 command and data messages carry one leading type-marker byte before
/// an AMF0-compatible body (`spec.md` §6); this strips it before delegating
/// to [`decode`] so callers never need to branch on the wire encoding
/// themselves.
///
/// # Errors
/// [`Error::Protocol`] if the payload is empty (AMF3 with no body to skip
/// to) or on AMF0 decode failure.
pub fn decode_message(msg: &Message) -> Result<Packet> {
    let is_data = msg.msg_type.is_data();
    if msg.msg_type.is_amf3() {
        let body = msg.payload.get(1..).ok_or_else(|| Error::Protocol("amf3 message has no body past the type marker".to_string()))?;
        decode(body, is_data)
    } else {
        decode(&msg.payload, is_data)
    }
}

/// Decodes one AMF0 command/data message payload into a [`Packet`].
///
/// Data messages (`onMetaData`) omit the leading transaction-id field that
/// command messages carry; `is_data` selects which layout to expect.
///
/// # Errors
/// [`Error::Protocol`] on AMF0 decode failure or a payload too short to
/// carry a command name.
pub fn decode(payload: &[u8], is_data: bool) -> Result<Packet> {
    let mut cursor = Cursor::new(payload);
    let name = amf0::read_string(&mut cursor)?;

    if is_data {
        let values = read_all(&mut cursor);
        return Ok(match name.as_str() {
            "onMetaData" | "@setDataFrame" => {
                Packet::OnMetaData { data: values.first().map(object_of).unwrap_or_default() }
            },
            other => Packet::Unknown { command_name: other.to_string(), transaction_id: 0.0, values },
        });
    }

    let transaction_id = amf0::read_number(&mut cursor).unwrap_or(0.0);

    match name.as_str() {
        command_name::CONNECT => {
            let args = amf0::read_any(&mut cursor).ok();
            let obj = args.as_ref().map(object_of).unwrap_or_default();
            Ok(Packet::ConnectApp {
                tc_url: string_field(&obj, "tcUrl"),
                app: string_field(&obj, "app"),
                flash_ver: string_field(&obj, "flashVer"),
                swf_url: string_field(&obj, "swfUrl"),
                page_url: string_field(&obj, "pageUrl"),
                object_encoding: obj.iter().find(|(k, _)| k == "objectEncoding").and_then(|(_, v)| v.as_f64()).unwrap_or(0.0),
                args: args.and_then(|v| v.as_object().cloned()),
            })
        },
        command_name::CREATE_STREAM => Ok(Packet::CreateStream { transaction_id }),
        command_name::CLOSE_STREAM => Ok(Packet::CloseStream { transaction_id }),
        command_name::RELEASE_STREAM => {
            let _ = amf0::read_any(&mut cursor);
            let stream_name = amf0::read_string(&mut cursor).unwrap_or_default();
            Ok(Packet::ReleaseStream { transaction_id, stream_name })
        },
        command_name::FC_PUBLISH => {
            let _ = amf0::read_any(&mut cursor);
            let stream_name = amf0::read_string(&mut cursor).unwrap_or_default();
            Ok(Packet::FcPublish { transaction_id, stream_name })
        },
        command_name::FC_UNPUBLISH => {
            let _ = amf0::read_any(&mut cursor);
            let stream_name = amf0::read_string(&mut cursor).unwrap_or_default();
            Ok(Packet::FcUnpublish { transaction_id, stream_name })
        },
        command_name::PUBLISH => {
            let _ = amf0::read_any(&mut cursor);
            let stream_name = amf0::read_string(&mut cursor).unwrap_or_default();
            let publish_type = amf0::read_string(&mut cursor).unwrap_or_else(|_| "live".to_string());
            Ok(Packet::Publish { transaction_id, stream_name, publish_type })
        },
        command_name::PLAY => {
            let _ = amf0::read_any(&mut cursor);
            let stream_name = amf0::read_string(&mut cursor).unwrap_or_default();
            let start = amf0::read_number(&mut cursor).unwrap_or(-2.0);
            let duration = amf0::read_number(&mut cursor).unwrap_or(-1.0);
            let reset = amf0::read_boolean(&mut cursor).unwrap_or(true);
            Ok(Packet::Play { transaction_id, stream_name, start, duration, reset })
        },
        command_name::PAUSE => {
            let _ = amf0::read_any(&mut cursor);
            let paused = amf0::read_boolean(&mut cursor).unwrap_or(true);
            let ms = amf0::read_number(&mut cursor).unwrap_or(0.0);
            Ok(Packet::Pause { transaction_id, paused, ms })
        },
        command_name::ON_BW_DONE => Ok(Packet::OnBwDone),
        command_name::ON_STATUS => {
            let _ = amf0::read_any(&mut cursor);
            let data = amf0::read_any(&mut cursor).map(|v| object_of(&v)).unwrap_or_default();
            Ok(Packet::OnStatusCall { transaction_id, data })
        },
        command_name::SAMPLE_ACCESS => {
            let video = amf0::read_boolean(&mut cursor).unwrap_or(false);
            let audio = amf0::read_boolean(&mut cursor).unwrap_or(false);
            Ok(Packet::SampleAccess { video, audio })
        },
        command_name::RESULT | command_name::ERROR => {
            let values = read_all(&mut cursor);
            Ok(Packet::CallRes { transaction_id, args: values })
        },
        other => {
            let values = read_all(&mut cursor);
            Ok(Packet::Unknown { command_name: other.to_string(), transaction_id, values })
        },
    }
}

/// Encodes a [`Packet`] to its AMF0 command/data payload bytes.
///
/// # Errors
/// Never fails today; returns `Result` to match [`amf0::write_any`]'s
/// signature and leave room for a size-bounded writer later.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match packet {
        Packet::ConnectApp { tc_url, app, flash_ver, swf_url, page_url, object_encoding, args } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::CONNECT))?;
            amf0::write_any(&mut out, &Amf0Value::Number(1.0))?;
            let mut props = vec![
                ("app".to_string(), Amf0Value::str(app.clone())),
                ("flashVer".to_string(), Amf0Value::str(flash_ver.clone())),
                ("swfUrl".to_string(), Amf0Value::str(swf_url.clone())),
                ("tcUrl".to_string(), Amf0Value::str(tc_url.clone())),
                ("fpad".to_string(), Amf0Value::Boolean(false)),
                ("pageUrl".to_string(), Amf0Value::str(page_url.clone())),
                ("objectEncoding".to_string(), Amf0Value::Number(*object_encoding)),
            ];
            if let Some(extra) = args {
                props.extend(extra.clone());
            }
            amf0::write_any(&mut out, &Amf0Value::Object(props))?;
        },
        Packet::ConnectAppRes { props, info } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::RESULT))?;
            amf0::write_any(&mut out, &Amf0Value::Number(1.0))?;
            amf0::write_any(&mut out, &Amf0Value::Object(props.clone()))?;
            amf0::write_any(&mut out, &Amf0Value::Object(info.clone()))?;
        },
        Packet::Call { transaction_id, command_name, args } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name.clone()))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            for arg in args {
                amf0::write_any(&mut out, arg)?;
            }
        },
        Packet::CallRes { transaction_id, args } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::RESULT))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            for arg in args {
                amf0::write_any(&mut out, arg)?;
            }
        },
        Packet::CreateStream { transaction_id } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::CREATE_STREAM))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
        },
        Packet::CreateStreamRes { transaction_id, stream_id } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::RESULT))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::Number(*stream_id))?;
        },
        Packet::CloseStream { transaction_id } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::CLOSE_STREAM))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
        },
        Packet::ReleaseStream { transaction_id, stream_name } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::RELEASE_STREAM))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::str(stream_name.clone()))?;
        },
        Packet::ReleaseStreamRes { transaction_id }
        | Packet::FcPublishRes { transaction_id }
        | Packet::FcUnpublishRes { transaction_id } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::RESULT))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Undefined)?;
        },
        Packet::FcPublish { transaction_id, stream_name } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::FC_PUBLISH))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::str(stream_name.clone()))?;
        },
        Packet::FcUnpublish { transaction_id, stream_name } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::FC_UNPUBLISH))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::str(stream_name.clone()))?;
        },
        Packet::Publish { transaction_id, stream_name, publish_type } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::PUBLISH))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::str(stream_name.clone()))?;
            amf0::write_any(&mut out, &Amf0Value::str(publish_type.clone()))?;
        },
        Packet::Play { transaction_id, stream_name, start, duration, reset } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::PLAY))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::str(stream_name.clone()))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*start))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*duration))?;
            amf0::write_any(&mut out, &Amf0Value::Boolean(*reset))?;
        },
        Packet::Pause { transaction_id, paused, ms } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::PAUSE))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::Boolean(*paused))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*ms))?;
        },
        Packet::OnStatusCall { transaction_id, data } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::ON_STATUS))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
            amf0::write_any(&mut out, &Amf0Value::Object(data.clone()))?;
        },
        Packet::OnStatusData { data } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::ON_STATUS))?;
            amf0::write_any(&mut out, &Amf0Value::Object(data.clone()))?;
        },
        Packet::OnFcPublish { data } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::ON_FC_PUBLISH))?;
            amf0::write_any(&mut out, &Amf0Value::Object(data.clone()))?;
        },
        Packet::OnFcUnpublish { data } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::ON_FC_UNPUBLISH))?;
            amf0::write_any(&mut out, &Amf0Value::Object(data.clone()))?;
        },
        Packet::OnBwDone => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::ON_BW_DONE))?;
            amf0::write_any(&mut out, &Amf0Value::Number(0.0))?;
            amf0::write_any(&mut out, &Amf0Value::Null)?;
        },
        Packet::SampleAccess { video, audio } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name::SAMPLE_ACCESS))?;
            amf0::write_any(&mut out, &Amf0Value::Boolean(*video))?;
            amf0::write_any(&mut out, &Amf0Value::Boolean(*audio))?;
        },
        Packet::OnMetaData { data } => {
            amf0::write_any(&mut out, &Amf0Value::str("onMetaData"))?;
            amf0::write_any(&mut out, &Amf0Value::EcmaArray(data.clone()))?;
        },
        Packet::Unknown { command_name, transaction_id, values } => {
            amf0::write_any(&mut out, &Amf0Value::str(command_name.clone()))?;
            amf0::write_any(&mut out, &Amf0Value::Number(*transaction_id))?;
            for v in values {
                amf0::write_any(&mut out, v)?;
            }
        },
    }
    Ok(out)
}

/// Tracks outstanding request transaction ids so a later `_result`/`_error`
/// reply can be matched back to the command name that caused it.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: u64,
    pending: HashMap<u64, String>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next transaction id for `command_name` and remembers it.
    pub fn next(&mut self, command_name: &str) -> f64 {
        self.next_id += 1;
        self.pending.insert(self.next_id, command_name.to_string());
        self.next_id as f64
    }

    /// Resolves and forgets a transaction id, returning the command name it
    /// was issued for, if still outstanding.
    pub fn resolve(&mut self, transaction_id: f64) -> Option<String> {
        self.pending.remove(&(transaction_id as u64))
    }
}

fn status_object(level: &str, code: &str, description: &str) -> Amf0Object {
    vec![
        ("level".to_string(), Amf0Value::str(level)),
        ("code".to_string(), Amf0Value::str(code)),
        ("description".to_string(), Amf0Value::str(description)),
    ]
}

/// Builds the `onStatus NetConnection.Connect.Rejected` packet redirecting a
/// client to `redirect_tc_url`, per the `ex.redirect`/`ex.redirect2` extended
/// fields this system's clients recognize.
#[must_use]
pub fn build_redirect(redirect_tc_url: &str, redirect_url: &str) -> Packet {
    let mut data = status_object("status", status_code::CONNECT_REJECTED, "Connection rejected, redirecting.");
    data.push((
        "ex".to_string(),
        Amf0Value::Object(vec![
            ("code".to_string(), Amf0Value::Number(302.0)),
            ("redirect".to_string(), Amf0Value::str(redirect_tc_url)),
            ("redirect2".to_string(), Amf0Value::str(redirect_url)),
        ]),
    ));
    Packet::OnStatusCall { transaction_id: 0.0, data }
}

/// The `connect` response sequence: `_result` (`NetConnection.Connect.Success`).
#[must_use]
pub fn build_connect_success(transaction_id: f64, object_encoding: f64) -> Packet {
    let props = vec![
        ("fmsVer".to_string(), Amf0Value::str("FMS/3,5,3,888")),
        ("capabilities".to_string(), Amf0Value::Number(127.0)),
        ("mode".to_string(), Amf0Value::Number(1.0)),
    ];
    let mut info = status_object("status", status_code::CONNECT_SUCCESS, "Connection succeeded.");
    info.push(("objectEncoding".to_string(), Amf0Value::Number(object_encoding)));
    Packet::ConnectAppRes { props, info: { let _ = transaction_id; info } }
}

/// The play-start response sequence (component E / §4.E): `StreamBegin` is a
/// user-control event sent by the caller (chunk layer), not a command
/// packet, so it is not part of this list.
#[must_use]
pub fn build_play_start_sequence(transaction_id: f64) -> Vec<Packet> {
    vec![
        Packet::OnStatusCall { transaction_id, data: status_object("status", status_code::STREAM_RESET, "Playing and resetting stream.") },
        Packet::OnStatusCall { transaction_id, data: status_object("status", status_code::STREAM_START, "Started playing stream.") },
        Packet::SampleAccess { video: true, audio: true },
        Packet::OnStatusData { data: status_object("status", status_code::DATA_START, "Data start.") },
    ]
}

/// The pause/unpause notify pair (caller also toggles `StreamEOF`/
/// `StreamBegin` user-control events around this).
#[must_use]
pub fn build_pause_notify(transaction_id: f64, paused: bool) -> Packet {
    let (code, desc) =
        if paused { (status_code::STREAM_PAUSE, "Paused stream.") } else { (status_code::STREAM_UNPAUSE, "Unpaused stream.") };
    Packet::OnStatusCall { transaction_id, data: status_object("status", code, desc) }
}

/// The FMLE publish-start response sequence: `releaseStream`/`FCPublish`/
/// `createStream` results, then `onFCPublish`/`onStatus` publish-start
/// notifications.
#[must_use]
pub fn build_fmle_publish_start_sequence(release_tid: f64, fc_publish_tid: f64, create_stream_tid: f64, stream_id: f64) -> Vec<Packet> {
    vec![
        Packet::ReleaseStreamRes { transaction_id: release_tid },
        Packet::FcPublishRes { transaction_id: fc_publish_tid },
        Packet::CreateStreamRes { transaction_id: create_stream_tid, stream_id },
        Packet::OnFcPublish { data: status_object("status", status_code::PUBLISH_START, "Started publishing stream.") },
        Packet::OnStatusCall { transaction_id: 0.0, data: status_object("status", status_code::PUBLISH_START, "Started publishing stream.") },
    ]
}

/// The unpublish response sequence: `onFCUnpublish` then the `FCUnpublish`
/// command result.
#[must_use]
pub fn build_unpublish_sequence(fc_unpublish_tid: f64) -> Vec<Packet> {
    vec![
        Packet::OnFcUnpublish { data: status_object("status", status_code::UNPUBLISH_SUCCESS, "Stream is now unpublished.") },
        Packet::FcUnpublishRes { transaction_id: fc_unpublish_tid },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtmpkit_core::types::MessageType;

    #[test]
    fn test_decode_connect_extracts_tc_url_and_app() {
        let packet = Packet::ConnectApp {
            tc_url: "rtmp://host/live".to_string(),
            app: "live".to_string(),
            flash_ver: "FMLE/3.0".to_string(),
            swf_url: String::new(),
            page_url: String::new(),
            object_encoding: 0.0,
            args: None,
        };
        let bytes = encode(&packet).unwrap();
        let decoded = decode(&bytes, false).unwrap();
        match decoded {
            Packet::ConnectApp { tc_url, app, .. } => {
                assert_eq!(tc_url, "rtmp://host/live");
                assert_eq!(app, "live");
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_decode_play_extracts_stream_name_and_args() {
        let packet = Packet::Play { transaction_id: 0.0, stream_name: "mystream".to_string(), start: -2.0, duration: -1.0, reset: true };
        let bytes = encode(&packet).unwrap();
        match decode(&bytes, false).unwrap() {
            Packet::Play { stream_name, start, .. } => {
                assert_eq!(stream_name, "mystream");
                assert_eq!(start, -2.0);
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_decode_publish_roundtrip() {
        let packet = Packet::Publish { transaction_id: 5.0, stream_name: "cam1".to_string(), publish_type: "live".to_string() };
        let bytes = encode(&packet).unwrap();
        match decode(&bytes, false).unwrap() {
            Packet::Publish { stream_name, publish_type, .. } => {
                assert_eq!(stream_name, "cam1");
                assert_eq!(publish_type, "live");
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_on_metadata_is_a_data_message() {
        let packet = Packet::OnMetaData { data: vec![("width".to_string(), Amf0Value::Number(1280.0))] };
        let bytes = encode(&packet).unwrap();
        match decode(&bytes, true).unwrap() {
            Packet::OnMetaData { data } => {
                assert_eq!(number_field(&data, "width"), 1280.0);
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_preserved_for_call_probes() {
        let payload = {
            let mut out = Vec::new();
            amf0::write_any(&mut out, &Amf0Value::str("_checkbw")).unwrap();
            amf0::write_any(&mut out, &Amf0Value::Number(3.0)).unwrap();
            out
        };
        match decode(&payload, false).unwrap() {
            Packet::Unknown { command_name, transaction_id, .. } => {
                assert_eq!(command_name, "_checkbw");
                assert_eq!(transaction_id, 3.0);
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_pending_requests_resolves_by_transaction_id() {
        let mut pending = PendingRequests::new();
        let tid = pending.next("createStream");
        assert_eq!(pending.resolve(tid).as_deref(), Some("createStream"));
        assert_eq!(pending.resolve(tid), None);
    }

    #[test]
    fn test_redirect_packet_carries_code_302() {
        let packet = build_redirect("rtmp://origin/live", "rtmp://origin/live/stream");
        match packet {
            Packet::OnStatusCall { data, .. } => {
                assert_eq!(string_field(&data, "code"), status_code::CONNECT_REJECTED);
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_play_start_sequence_has_four_messages_in_order() {
        let seq = build_play_start_sequence(0.0);
        assert_eq!(seq.len(), 4);
        assert!(matches!(seq[0], Packet::OnStatusCall { .. }));
        assert!(matches!(seq[3], Packet::OnStatusData { .. }));
    }

    #[test]
    fn test_fmle_publish_start_sequence_has_five_messages() {
        let seq = build_fmle_publish_start_sequence(1.0, 2.0, 3.0, 1.0);
        assert_eq!(seq.len(), 5);
    }

    #[test]
    fn test_decode_message_skips_leading_byte_for_amf3_command() {
        let packet = Packet::Publish { transaction_id: 5.0, stream_name: "cam1".to_string(), publish_type: "live".to_string() };
        let amf0_body = encode(&packet).unwrap();
        let mut amf3_payload = vec![0u8]; // AMF3 command marker, skipped before AMF0 decode
        amf3_payload.extend_from_slice(&amf0_body);
        let msg = Message::new(MessageType::Amf3Command, 0, 1, amf3_payload.into());

        match decode_message(&msg).unwrap() {
            Packet::Publish { stream_name, .. } => assert_eq!(stream_name, "cam1"),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_decode_message_rejects_empty_amf3_payload() {
        let msg = Message::new(MessageType::Amf3Command, 0, 1, Bytes::new());
        assert!(decode_message(&msg).is_err());
    }
}
