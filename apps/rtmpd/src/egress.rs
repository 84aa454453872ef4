// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HTTP live-egress accept loop (component K/L): parses one request head per
//! connection via `rtmpkit_http::framing`, resolves the path against the
//! configured mounts, and hands the rest of the work to
//! `rtmpkit_http::egress::serve_live`, which already implements the
//! consumer-queue pump and container framing.

use crate::hooks::{self, HookEvent};
use crate::state::AppState;
use rtmpkit_core::types::StreamKey;
use rtmpkit_http::{egress::EgressHooks, framing, ResponseWriter};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Fires the HTTP-egress `on_play`/`on_stop` hooks using the same vhost
/// hook URL lists the RTMP connection FSM gates `play` with.
struct HttpEgressHooks {
    state: AppState,
}

#[async_trait::async_trait]
impl EgressHooks for HttpEgressHooks {
    async fn on_play(&self, key: &StreamKey, request_url: &str) -> bool {
        let Some(vhost_cfg) = self.state.config.vhost(&key.vhost) else { return false };
        if !vhost_cfg.http_hooks.enabled {
            return true;
        }
        let event = HookEvent {
            action: "on_play".to_string(),
            client_id: String::new(),
            ip: String::new(),
            vhost: key.vhost.clone(),
            app: key.app.clone(),
            stream: key.stream.clone(),
            param: String::new(),
            tc_url: String::new(),
            page_url: request_url.to_string(),
            duration: None,
        };
        hooks::fire_gated(&vhost_cfg.http_hooks.on_play, &event).await
    }

    async fn on_stop(&self, key: &StreamKey) {
        let Some(vhost_cfg) = self.state.config.vhost(&key.vhost) else { return };
        if !vhost_cfg.http_hooks.enabled {
            return;
        }
        let event = HookEvent {
            action: "on_stop".to_string(),
            client_id: String::new(),
            ip: String::new(),
            vhost: key.vhost.clone(),
            app: key.app.clone(),
            stream: key.stream.clone(),
            param: String::new(),
            tc_url: String::new(),
            page_url: String::new(),
            duration: None,
        };
        hooks::notify_all(&vhost_cfg.http_hooks.on_stop, &event).await;
    }
}

/// Binds `listen` and serves egress requests until the process exits.
///
/// # Errors
/// Returns an error if the listener cannot be bound.
pub async fn serve(listen: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(listen, "http egress listener bound");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, peer_addr, state).await {
                tracing::debug!(%peer_addr, %error, "http egress connection ended");
            }
        });
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, peer_addr: SocketAddr, state: AppState) -> rtmpkit_core::error::Result<()> {
    stream.set_nodelay(true).ok();
    let head = framing::read_request_head(&mut stream).await?;

    if head.effective_method() != "GET" {
        let mut response = ResponseWriter::new(&mut stream);
        response.write_head(405, "Method Not Allowed", "text/plain", Some(0), &[]).await?;
        response.finish().await?;
        return Ok(());
    }

    let Some(entry) = state.mounts.resolve(&head.path).await else {
        tracing::debug!(%peer_addr, path = %head.path, "http egress path matched no mount");
        let mut response = ResponseWriter::new(&mut stream);
        response.write_head(404, "Not Found", "text/plain", Some(9), &[]).await?;
        response.write_body(b"not found").await?;
        response.finish().await?;
        return Ok(());
    };

    let host = head.header("host").unwrap_or("unknown").to_string();
    let request_url = format!("http://{host}{}", head.path);
    let hooks = HttpEgressHooks { state: state.clone() };
    if let Err(error) = rtmpkit_http::egress::serve_live(&mut stream, &state.sources, &state.audio_taps, &entry, &request_url, &hooks).await {
        tracing::debug!(%peer_addr, stream = %entry.key, %error, "http egress request failed");
        let mut response = ResponseWriter::new(&mut stream);
        response.write_head(404, "Not Found", "text/plain", Some(0), &[]).await.ok();
        response.finish().await.ok();
    }
    Ok(())
}
