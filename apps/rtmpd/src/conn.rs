// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The RTMP connection state machine (component J): handshake → connect →
//! identify → `{Publishing, Playing}` → cleanup, one `tokio::spawn`ed task
//! per accepted socket.
//!
//! Ported from `examples/original_source/app_rtmp_conn.cpp`'s
//! `RtmpConn::do_cycle` loop, with the single-threaded cooperative stepping
//! translated to `tokio::select!`/`.await` suspension points (`spec.md` §5).

use crate::config::{Config, VhostConfig};
use crate::edge;
use crate::hooks::{self, HookEvent};
use crate::state::AppState;
use bytes::Bytes;
use rtmpkit_core::error::{ControlError, Error, Result};
use rtmpkit_core::security::{self, Verb};
use rtmpkit_core::types::{ConnType, Message, MessageType, Request};
use rtmpkit_live::{ConsumerOptions, ConsumerQueue, JitterAlgorithm, SourceHandle};
use rtmpkit_proto::amf0::Amf0Value;
use rtmpkit_proto::chunk::{ChunkProtocol, UserControlEvent};
use rtmpkit_proto::command::{self, Packet};
use rtmpkit_proto::handshake;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A viewer's consumer queue sheds backlog past this span (`spec.md` §4.I);
/// not separately configurable per vhost, matching `rtmpkit_http::egress`'s
/// own fixed choice for the same knob.
const PLAY_CONSUMER_MAX_QUEUE_MS: i64 = 10_000;

fn command_message(packet: &Packet) -> Result<Message> {
    let bytes = command::encode(packet)?;
    Ok(Message::new(MessageType::Amf0Command, 0, 0, Bytes::from(bytes)))
}

fn ipv4_of(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    }
}

fn split_param(name: &str) -> (String, String) {
    match name.split_once('?') {
        Some((head, param)) => (head.to_string(), param.to_string()),
        None => (name.to_string(), String::new()),
    }
}

/// Recovers the vhost name from, in order: a `vhost=` param on the `app`
/// string, a `vhost` query parameter on `tcUrl`, or the `tcUrl` host itself —
/// falling back to the default vhost if none of those name a configured one.
fn resolve_vhost_name(tc_url: &str, app: &str, config: &Config) -> String {
    let (_, app_query) = split_param(app);
    let from_app_query = app_query.split('&').find_map(|kv| kv.strip_prefix("vhost=").map(str::to_string));
    let from_tc_url = url::Url::parse(tc_url).ok().and_then(|u| u.query_pairs().find(|(k, _)| k == "vhost").map(|(_, v)| v.into_owned()));
    let host_fallback = url::Url::parse(tc_url).ok().and_then(|u| u.host_str().map(str::to_string));

    from_app_query
        .or(from_tc_url)
        .or(host_fallback)
        .filter(|candidate| config.vhosts.contains_key(candidate))
        .unwrap_or_else(|| crate::config::DEFAULT_VHOST.to_string())
}

fn status_packet(code: &'static str, description: &'static str, transaction_id: f64) -> Packet {
    Packet::OnStatusCall {
        transaction_id,
        data: vec![
            ("level".to_string(), Amf0Value::str("status")),
            ("code".to_string(), Amf0Value::str(code)),
            ("description".to_string(), Amf0Value::str(description)),
        ],
    }
}

fn call_result(transaction_id: f64) -> Packet {
    Packet::CallRes { transaction_id, args: vec![Amf0Value::Null, Amf0Value::Null] }
}

/// Entry point handed to the RTMP accept loop: runs one connection to
/// completion and logs however it ended.
pub async fn handle(stream: TcpStream, peer_addr: SocketAddr, state: AppState) {
    match run(stream, peer_addr, &state).await {
        Ok(()) => {},
        Err(error) if error.is_warn_level() => tracing::warn!(%peer_addr, %error, "rtmp connection ended"),
        Err(error) => tracing::error!(%peer_addr, %error, "rtmp connection failed"),
    }
}

async fn run(mut stream: TcpStream, peer_addr: SocketAddr, state: &AppState) -> Result<()> {
    stream.set_nodelay(true).ok();
    let outcome = handshake::server_handshake(&mut stream).await?;
    let client_ip = outcome.proxy_real_ip.map_or_else(|| peer_addr.ip(), IpAddr::V4);

    let mut chunk = ChunkProtocol::new(stream);
    let (mut request, connect_args) = await_connect(&mut chunk, &state.config, &client_ip.to_string()).await?;

    let Some(vhost_cfg) = state.config.vhost(&request.vhost).cloned() else {
        return Err(Error::Config(format!("no vhost resolves for {}", request.vhost)));
    };
    if !vhost_cfg.enabled {
        return Err(Error::Auth(format!("vhost {} is disabled", request.vhost)));
    }

    let vhost_id = state.stats.lock().await.on_vhost(&request.vhost);
    let client_id = state.stats.lock().await.on_client(&vhost_id, &request.ip, &request.page_url, ConnType::Unknown);

    if vhost_cfg.http_hooks.enabled {
        let event = connect_hook_event(&request, &client_id);
        if !hooks::fire_gated(&vhost_cfg.http_hooks.on_connect, &event).await {
            state.stats.lock().await.on_disconnect(&client_id);
            return Err(Error::Auth("on_connect hook rejected connection".into()));
        }
    }

    chunk.set_in_ack_window(vhost_cfg.in_ack_size);
    chunk.send_window_ack_size(vhost_cfg.out_ack_size).await?;
    chunk.send_set_peer_bandwidth(vhost_cfg.out_ack_size, 2).await?;
    chunk.send_set_chunk_size(vhost_cfg.chunk_size).await?;
    chunk.send_message(&command_message(&command::build_connect_success(1.0, request.object_encoding))?).await?;

    let result = service_loop(&mut chunk, state, &vhost_cfg, &vhost_id, &client_id, &mut request, connect_args.as_deref()).await;

    state.stats.lock().await.on_disconnect(&client_id);
    if vhost_cfg.http_hooks.enabled {
        let event = connect_hook_event(&request, &client_id);
        hooks::notify_all(&vhost_cfg.http_hooks.on_close, &event).await;
    }
    result
}

fn connect_hook_event(request: &Request, client_id: &str) -> HookEvent {
    HookEvent {
        action: "on_connect".to_string(),
        client_id: client_id.to_string(),
        ip: request.ip.clone(),
        vhost: request.vhost.clone(),
        app: request.app.clone(),
        stream: String::new(),
        param: String::new(),
        tc_url: request.tc_url.clone(),
        page_url: request.page_url.clone(),
        duration: None,
    }
}

/// Reads messages until the client's `connect` command arrives. `spec.md`
/// guarantees `connect` is the first command a client sends once the
/// handshake completes; anything else observed first (there shouldn't be
/// anything) is ignored rather than treated as fatal.
async fn await_connect<S>(chunk: &mut ChunkProtocol<S>, config: &Config, ip: &str) -> Result<(Request, Option<Vec<(String, Amf0Value)>>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = chunk.recv_message().await?;
        if !msg.msg_type.is_command() {
            continue;
        }
        let Packet::ConnectApp { tc_url, app, swf_url, page_url, object_encoding, args, .. } = command::decode_message(&msg)? else {
            continue;
        };
        let vhost = resolve_vhost_name(&tc_url, &app, config);
        let schema = tc_url.split("://").next().unwrap_or("rtmp").to_string();
        let host = url::Url::parse(&tc_url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default();
        let port = url::Url::parse(&tc_url).ok().and_then(|u| u.port()).unwrap_or(1935);
        let (bare_app, _) = split_param(&app);
        let request = Request {
            tc_url,
            page_url,
            swf_url,
            schema,
            host,
            vhost,
            app: bare_app,
            stream: String::new(),
            port,
            param: String::new(),
            duration_ms: None,
            object_encoding,
            ip: ip.to_string(),
        };
        return Ok((request, args));
    }
}

/// What the identify FSM discovered: a connecting client becomes exactly one
/// of these before the first iteration of the service loop proper.
enum Identified {
    Publish { conn_type: ConnType, stream_name: String, release_tid: f64, fc_publish_tid: f64, create_stream_tid: f64, publish_tid: f64 },
    Play { stream_name: String, duration: f64, play_tid: f64 },
}

/// Reads commands until a `publish` or `play` request names a stream,
/// answering `createStream`/`call` probes along the way and classifying the
/// publish flow (FMLE vs. bare Flash vs. Haivision) from which commands
/// preceded `publish` (`spec.md` §4.J "identify", supplemented by
/// `app_rtmp_conn.cpp`'s client-type classification).
async fn identify<S>(chunk: &mut ChunkProtocol<S>) -> Result<(Identified, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut release_tid = 0.0;
    let mut fc_publish_tid = 0.0;
    let mut create_stream_tid = 0.0;
    let mut saw_fmle_prelude = false;

    loop {
        let msg = chunk.recv_message().await?;
        if !msg.msg_type.is_command() {
            continue;
        }
        match command::decode_message(&msg)? {
            Packet::ReleaseStream { transaction_id, .. } => {
                release_tid = transaction_id;
                saw_fmle_prelude = true;
            },
            Packet::FcPublish { transaction_id, .. } => {
                fc_publish_tid = transaction_id;
                saw_fmle_prelude = true;
            },
            Packet::CreateStream { transaction_id } => {
                create_stream_tid = transaction_id;
                chunk.send_message(&command_message(&Packet::CreateStreamRes { transaction_id, stream_id: 1.0 })?).await?;
            },
            Packet::Publish { transaction_id, stream_name, publish_type } => {
                let (name, param) = split_param(&stream_name);
                let conn_type = if saw_fmle_prelude {
                    ConnType::FmlePublish
                } else if publish_type.eq_ignore_ascii_case("haivision") {
                    ConnType::HaivisionPublish
                } else {
                    ConnType::FlashPublish
                };
                return Ok((
                    Identified::Publish { conn_type, stream_name: name, release_tid, fc_publish_tid, create_stream_tid, publish_tid: transaction_id },
                    param,
                ));
            },
            Packet::Play { transaction_id, stream_name, duration, .. } => {
                let (name, param) = split_param(&stream_name);
                return Ok((Identified::Play { stream_name: name, duration, play_tid: transaction_id }, param));
            },
            Packet::Call { transaction_id, .. } if transaction_id > 0.0 => {
                chunk.send_message(&command_message(&call_result(transaction_id))?).await?;
            },
            Packet::CloseStream { .. } => return Err(Error::Control(ControlError::RtmpClose)),
            _ => {},
        }
    }
}

/// The `ServiceLoop` from `spec.md` §4.J: identify once, dispatch to
/// publishing or playing, and loop back to identify again on `Republish`/
/// `RtmpClose` rather than tearing the connection down.
async fn service_loop<S>(
    chunk: &mut ChunkProtocol<S>,
    state: &AppState,
    vhost_cfg: &VhostConfig,
    vhost_id: &str,
    client_id: &str,
    request: &mut Request,
    connect_args: Option<&[(String, Amf0Value)]>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (identified, param) = identify(chunk).await?;
        request.param = param;

        let outcome = match identified {
            Identified::Publish { conn_type, stream_name, release_tid, fc_publish_tid, create_stream_tid, publish_tid } => {
                request.stream = stream_name;
                run_publish(
                    chunk,
                    state,
                    vhost_cfg,
                    vhost_id,
                    client_id,
                    request,
                    connect_args,
                    conn_type,
                    release_tid,
                    fc_publish_tid,
                    create_stream_tid,
                    publish_tid,
                )
                .await
            },
            Identified::Play { stream_name, duration, play_tid } => {
                request.stream = stream_name;
                run_play(chunk, state, vhost_cfg, vhost_id, client_id, request, play_tid, duration).await
            },
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(error) if error.is_republish() || error.is_rtmp_close() => continue,
            Err(error) => return Err(error),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_publish<S>(
    chunk: &mut ChunkProtocol<S>,
    state: &AppState,
    vhost_cfg: &VhostConfig,
    vhost_id: &str,
    client_id: &str,
    request: &Request,
    connect_args: Option<&[(String, Amf0Value)]>,
    conn_type: ConnType,
    release_tid: f64,
    fc_publish_tid: f64,
    create_stream_tid: f64,
    publish_tid: f64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if vhost_cfg.security.enabled {
        let rules = build_security_rules(vhost_cfg);
        if !rules.allows(Verb::Publish, ipv4_of(parse_ip(&request.ip))) {
            return Err(Error::Auth(format!("security rules deny publish from {}", request.ip)));
        }
    }
    if vhost_cfg.refer.enabled {
        let suffixes: Vec<String> = vhost_cfg.refer.all.iter().chain(vhost_cfg.refer.publish.iter()).cloned().collect();
        if !suffixes.is_empty() && !security::referer_allowed(&request.page_url, &suffixes) {
            return Err(Error::Auth("referer rejected publish".into()));
        }
    }

    let debug = connect_args.map(|a| a.iter().any(|(k, v)| k == "rtmpkit_edge_debug" && v.as_f64() == Some(1.0))).unwrap_or(false);

    if vhost_cfg.http_hooks.enabled {
        let event = publish_hook_event("on_publish", request, client_id, None);
        if !hooks::fire_gated(&vhost_cfg.http_hooks.on_publish, &event).await {
            return Err(Error::Auth("on_publish hook rejected publish".into()));
        }
    }

    let source = state.sources.get_or_create(request.stream_key(), vhost_cfg.gop_cache).await;

    let upstream = if vhost_cfg.edge {
        Some(edge::traverse(&vhost_cfg.edge_origin, request, debug).await?)
    } else {
        None
    };
    source.acquire_publish(vhost_cfg.edge, upstream).await?;

    let stream_id = state.stats.lock().await.on_stream(vhost_id, &request.app, &request.stream, &request.tc_url, &request.get_stream_url());
    state.stats.lock().await.on_client_stream(client_id, &stream_id);
    state.stats.lock().await.on_publish_start(&stream_id, client_id);

    let start_result = publish_start_sequence(chunk, conn_type, release_tid, fc_publish_tid, create_stream_tid, publish_tid).await;
    if let Err(error) = start_result {
        source.unpublish().await;
        return Err(error);
    }

    let outcome = publish_receive_loop(chunk, &source, vhost_cfg, state, &stream_id).await;

    source.unpublish().await;
    state.stats.lock().await.on_unpublish(&stream_id);
    if vhost_cfg.http_hooks.enabled {
        let event = publish_hook_event("on_unpublish", request, client_id, None);
        hooks::notify_all(&vhost_cfg.http_hooks.on_unpublish, &event).await;
    }
    outcome
}

async fn publish_start_sequence<S>(
    chunk: &mut ChunkProtocol<S>,
    conn_type: ConnType,
    release_tid: f64,
    fc_publish_tid: f64,
    create_stream_tid: f64,
    publish_tid: f64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if conn_type == ConnType::FmlePublish {
        for packet in command::build_fmle_publish_start_sequence(release_tid, fc_publish_tid, create_stream_tid, 1.0) {
            chunk.send_message(&command_message(&packet)?).await?;
        }
    } else {
        chunk
            .send_message(&command_message(&status_packet(
                command::status_code::PUBLISH_START,
                "Started publishing stream.",
                publish_tid,
            ))?)
            .await?;
    }
    Ok(())
}

fn publish_hook_event(action: &str, request: &Request, client_id: &str, duration: Option<f64>) -> HookEvent {
    HookEvent {
        action: action.to_string(),
        client_id: client_id.to_string(),
        ip: request.ip.clone(),
        vhost: request.vhost.clone(),
        app: request.app.clone(),
        stream: request.stream.clone(),
        param: request.param.clone(),
        tc_url: request.tc_url.clone(),
        page_url: request.page_url.clone(),
        duration,
    }
}

async fn publish_receive_loop<S>(chunk: &mut ChunkProtocol<S>, source: &SourceHandle, vhost_cfg: &VhostConfig, state: &AppState, stream_id: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first_packet = true;
    loop {
        let deadline = if first_packet {
            Duration::from_millis(vhost_cfg.publish_1stpkt_timeout_ms)
        } else {
            Duration::from_millis(vhost_cfg.publish_normal_timeout_ms)
        };
        let msg = timeout(deadline, chunk.recv_message())
            .await
            .map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??;
        first_packet = false;

        state.stats.lock().await.on_bytes(stream_id, 0, msg.payload.len() as u64);

        match msg.msg_type {
            MessageType::Audio => source.on_audio(msg).await,
            MessageType::Video => source.on_video(msg).await,
            MessageType::Amf0Data | MessageType::Amf3Data => source.on_metadata(msg).await,
            MessageType::Aggregate => source.on_aggregate(msg).await,
            MessageType::Amf0Command | MessageType::Amf3Command => {
                match command::decode_message(&msg)? {
                    Packet::FcUnpublish { transaction_id, .. } => {
                        for packet in command::build_unpublish_sequence(transaction_id) {
                            chunk.send_message(&command_message(&packet)?).await?;
                        }
                        return Err(Error::Control(ControlError::Republish));
                    },
                    Packet::CloseStream { .. } => return Err(Error::Control(ControlError::RtmpClose)),
                    Packet::Call { transaction_id, .. } if transaction_id > 0.0 => {
                        chunk.send_message(&command_message(&call_result(transaction_id))?).await?;
                    },
                    _ => {},
                }
            },
            _ => {},
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_play<S>(
    chunk: &mut ChunkProtocol<S>,
    state: &AppState,
    vhost_cfg: &VhostConfig,
    vhost_id: &str,
    client_id: &str,
    request: &Request,
    play_tid: f64,
    duration: f64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if vhost_cfg.security.enabled {
        let rules = build_security_rules(vhost_cfg);
        if !rules.allows(Verb::Play, ipv4_of(parse_ip(&request.ip))) {
            return Err(Error::Auth(format!("security rules deny play from {}", request.ip)));
        }
    }
    if vhost_cfg.refer.enabled {
        let suffixes: Vec<String> = vhost_cfg.refer.all.iter().chain(vhost_cfg.refer.play.iter()).cloned().collect();
        if !suffixes.is_empty() && !security::referer_allowed(&request.page_url, &suffixes) {
            return Err(Error::Auth("referer rejected play".into()));
        }
    }
    if vhost_cfg.http_hooks.enabled {
        let event = publish_hook_event("on_play", request, client_id, None);
        if !hooks::fire_gated(&vhost_cfg.http_hooks.on_play, &event).await {
            return Err(Error::Auth("on_play hook rejected play".into()));
        }
    }

    let stream_id = state.stats.lock().await.on_stream(vhost_id, &request.app, &request.stream, &request.tc_url, &request.get_stream_url());
    state.stats.lock().await.on_client_stream(client_id, &stream_id);

    let source = state.sources.get_or_create(request.stream_key(), vhost_cfg.gop_cache).await;
    let options = ConsumerOptions { max_queue_ms: PLAY_CONSUMER_MAX_QUEUE_MS, jitter: JitterAlgorithm::Zero, seed_gop: true };
    let (consumer_id, mut queue) = source.attach(options).await?;

    chunk.send_user_control(UserControlEvent::StreamBegin(1)).await?;
    for packet in command::build_play_start_sequence(play_tid) {
        chunk.send_message(&command_message(&packet)?).await?;
    }

    let duration_ms = if duration > 0.0 { Some(duration as u64 * 1000) } else { None };
    let outcome = play_pump_loop(chunk, &mut queue, vhost_cfg, state, &stream_id, duration_ms).await;

    source.detach(consumer_id).await;
    if vhost_cfg.http_hooks.enabled {
        let event = publish_hook_event("on_stop", request, client_id, None);
        hooks::notify_all(&vhost_cfg.http_hooks.on_stop, &event).await;
    }
    outcome
}

/// Alternates between draining the consumer queue (pump side) and checking
/// for control commands from the peer (pause/call/closeStream), per
/// `spec.md` §4.J's "dedicated receive side" description.
///
/// Known limitation: `chunk.recv_message()` is not cancel-safe mid-chunk, so
/// racing it in `tokio::select!` against the queue wait can in rare cases
/// desync chunk framing if a control message arrives exactly as a pump
/// cycle's wait resolves. TODO: back `ChunkProtocol`'s reader with
/// `rtmpkit_core::buffer`'s read-ahead cache so reads become resumable
/// before reintroducing real concurrency here.
async fn play_pump_loop<S>(
    chunk: &mut ChunkProtocol<S>,
    queue: &mut ConsumerQueue,
    vhost_cfg: &VhostConfig,
    state: &AppState,
    stream_id: &str,
    duration_ms: Option<u64>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut elapsed_ms: u64 = 0;
    let mw_sleep = Duration::from_millis(vhost_cfg.mw_sleep_ms);
    loop {
        tokio::select! {
            biased;

            incoming = chunk.recv_message() => {
                let msg = incoming?;
                if !msg.msg_type.is_command() {
                    continue;
                }
                match command::decode_message(&msg)? {
                    Packet::Pause { transaction_id, paused, .. } => {
                        queue.on_play_client_pause(paused);
                        chunk.send_message(&command_message(&command::build_pause_notify(transaction_id, paused))?).await?;
                        let event = if paused { UserControlEvent::StreamEof(1) } else { UserControlEvent::StreamBegin(1) };
                        chunk.send_user_control(event).await?;
                    },
                    Packet::Call { transaction_id, .. } if transaction_id > 0.0 => {
                        chunk.send_message(&command_message(&call_result(transaction_id))?).await?;
                    },
                    Packet::CloseStream { .. } => return Err(Error::Control(ControlError::RtmpClose)),
                    _ => {},
                }
            }

            () = queue.wait(vhost_cfg.mw_msgs, mw_sleep) => {
                if queue.is_unpublished() && queue.dump_packets(0).is_empty() {
                    return Ok(());
                }
                let batch = queue.dump_packets(0);
                if batch.is_empty() {
                    continue;
                }
                if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
                    elapsed_ms += u64::from(last.timestamp_ms.saturating_sub(first.timestamp_ms));
                }
                if let Some(limit) = duration_ms {
                    if elapsed_ms >= limit {
                        return Err(Error::Stream("play duration exceeded".into()));
                    }
                }
                let mut sent = 0u64;
                for msg in &batch {
                    sent += msg.payload.len() as u64;
                    chunk.send_message(msg).await?;
                }
                state.stats.lock().await.on_bytes(stream_id, sent, 0);
            }
        }
    }
}

fn parse_ip(ip: &str) -> IpAddr {
    ip.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn build_security_rules(vhost_cfg: &VhostConfig) -> security::SecurityRules {
    let mut rules = security::SecurityRules::default();
    for rule in &vhost_cfg.security.rules {
        let Some(verb) = (if rule.verb.eq_ignore_ascii_case("play") { Some(Verb::Play) } else if rule.verb.eq_ignore_ascii_case("publish") { Some(Verb::Publish) } else { None }) else {
            continue;
        };
        let Some(target) = security::Target::parse(&rule.target) else { continue };
        let parsed = security::Rule { verb, target };
        if rule.action.eq_ignore_ascii_case("allow") {
            rules.allow.push(parsed);
        } else if rule.action.eq_ignore_ascii_case("deny") {
            rules.deny.push(parsed);
        }
    }
    rules
}
