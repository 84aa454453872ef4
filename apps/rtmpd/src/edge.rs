// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Edge token traverse (`spec.md` §4.J "Edge token traverse", §4.H
//! "Supplement"): before an edge node admits a publisher, it proves the
//! publish is authorized by opening its own RTMP client connection to each
//! configured origin in turn, carrying the original connect args and debug
//! flag, and accepting the first origin that completes `connect` +
//! `createStream` + `publish` as authorization. The resulting client
//! connection is then kept open as the [`EdgeUpstream`] the live source
//! forwards every subsequent audio/video/metadata message to.

use bytes::Bytes;
use rtmpkit_core::error::{Error, Result};
use rtmpkit_core::types::{Message, MessageType, Request};
use rtmpkit_live::EdgeUpstream;
use rtmpkit_proto::amf0::Amf0Value;
use rtmpkit_proto::chunk::ChunkProtocol;
use rtmpkit_proto::command::{self, Packet};
use rtmpkit_proto::handshake;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Origin handshake + connect + createStream + publish must complete within
/// this bound (`spec.md` §5 "edge token traverse uses a 3-second timeout").
const TRAVERSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A publish connection opened by this edge node to an authorized origin.
struct EdgeUpstreamClient {
    chunk: Mutex<ChunkProtocol<TcpStream>>,
    stream_id: u32,
}

#[async_trait::async_trait]
impl EdgeUpstream for EdgeUpstreamClient {
    async fn forward(&self, msg: &Message) -> Result<()> {
        let forwarded = Message::new(msg.msg_type, msg.timestamp_ms, self.stream_id, msg.payload.clone());
        self.chunk.lock().await.send_message(&forwarded).await
    }
}

fn command_message(packet: &Packet) -> Result<Message> {
    let bytes = command::encode(packet)?;
    Ok(Message::new(MessageType::Amf0Command, 0, 0, Bytes::from(bytes)))
}

async fn recv_command<S>(chunk: &mut ChunkProtocol<S>) -> Result<Packet>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let msg = chunk.recv_message().await?;
        if msg.msg_type.is_command() {
            return command::decode_message(&msg);
        }
    }
}

/// Tries one origin (`host:port`), returning an authorized upstream handle
/// on success.
async fn try_origin(origin: &str, request: &Request, debug: bool) -> Result<Arc<dyn EdgeUpstream>> {
    let mut stream = TcpStream::connect(origin).await?;
    stream.set_nodelay(true).ok();
    handshake::client_handshake(&mut stream).await?;

    let mut chunk = ChunkProtocol::new(stream);
    let mut pending = command::PendingRequests::new();

    let mut args: Vec<(String, Amf0Value)> = vec![("rtmpkit_edge_debug".to_string(), Amf0Value::Boolean(debug))];
    if !request.param.is_empty() {
        args.push(("rtmpkit_edge_param".to_string(), Amf0Value::str(request.param.clone())));
    }
    let connect = Packet::ConnectApp {
        tc_url: request.tc_url.clone(),
        app: request.app.clone(),
        flash_ver: "FMLE/3.0 (compatible; RtmpKit Edge)".to_string(),
        swf_url: request.swf_url.clone(),
        page_url: request.page_url.clone(),
        object_encoding: request.object_encoding,
        args: Some(args),
    };
    chunk.send_message(&command_message(&connect)?).await?;

    match recv_command(&mut chunk).await? {
        Packet::ConnectAppRes { .. } => {},
        other => return Err(Error::Auth(format!("edge origin {origin} rejected connect: {other:?}"))),
    }

    let create_stream_tid = pending.next("createStream");
    chunk.send_message(&command_message(&Packet::CreateStream { transaction_id: create_stream_tid })?).await?;
    let stream_id = match recv_command(&mut chunk).await? {
        Packet::CreateStreamRes { stream_id, .. } => stream_id,
        other => return Err(Error::Auth(format!("edge origin {origin} rejected createStream: {other:?}"))),
    };

    let publish_tid = pending.next("publish");
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let stream_id_u32 = stream_id as u32;
    chunk
        .send_message(&command_message(&Packet::Publish {
            transaction_id: publish_tid,
            stream_name: request.stream.clone(),
            publish_type: "live".to_string(),
        })?)
        .await?;

    Ok(Arc::new(EdgeUpstreamClient { chunk: Mutex::new(chunk), stream_id: stream_id_u32 }))
}

/// Tries every configured origin in order, returning the first one that
/// authorizes the publish. `debug` is carried through to the origin so its
/// logs can correlate the traverse attempt with the edge-side connection.
///
/// # Errors
/// [`Error::Auth`] if no configured origin authorizes the publish, or if
/// `origins` is empty.
pub async fn traverse(origins: &[String], request: &Request, debug: bool) -> Result<Arc<dyn EdgeUpstream>> {
    if origins.is_empty() {
        return Err(Error::Auth("edge vhost has no configured origins".into()));
    }
    for origin in origins {
        match timeout(TRAVERSE_TIMEOUT, try_origin(origin, request, debug)).await {
            Ok(Ok(upstream)) => return Ok(upstream),
            Ok(Err(error)) => tracing::warn!(origin, %error, "edge token traverse rejected by origin"),
            Err(_) => tracing::warn!(origin, "edge token traverse timed out"),
        }
    }
    Err(Error::Auth(format!("edge token traverse: no origin among {} authorized this publish", origins.len())))
}
