// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Outbound HTTP-hook callbacks (`spec.md` §4.J "HTTP hooks", §6).
//!
//! Built directly on `tokio::net::TcpStream` rather than a general HTTP
//! client crate, matching `rtmpkit-http::framing`'s "hand-rolled, not a
//! general-purpose HTTP stack" approach (`crates/http/src/framing.rs`) —
//! hook calls are simple, infrequent, same-shape POSTs and don't need a
//! connection-pooling client.

use rtmpkit_core::error::{Error, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

/// Hook requests must not be allowed to stall a connection FSM indefinitely;
/// `spec.md` does not name a value for this, so we pick a conservative one.
const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// The JSON body shape named in `spec.md` §6: `{action, client_id, ip, vhost,
/// app, stream, param, tcUrl, pageUrl, [duration]}`.
#[derive(Debug, Clone, Serialize)]
pub struct HookEvent {
    pub action: String,
    pub client_id: String,
    pub ip: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub param: String,
    #[serde(rename = "tcUrl")]
    pub tc_url: String,
    #[serde(rename = "pageUrl")]
    pub page_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Posts `event` to a single hook `url`, returning whether the response was
/// 2xx. A connect failure or timeout is treated as non-2xx so a dead hook
/// endpoint degrades to "reject" rather than hanging the caller.
pub async fn post(url: &str, event: &HookEvent) -> bool {
    match timeout(HOOK_TIMEOUT, post_inner(url, event)).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(error)) => {
            tracing::warn!(url, %error, "http hook request failed");
            false
        },
        Err(_) => {
            tracing::warn!(url, "http hook request timed out");
            false
        },
    }
}

async fn post_inner(url: &str, event: &HookEvent) -> Result<bool> {
    let parsed = Url::parse(url).map_err(|e| Error::Http(format!("invalid hook url {url}: {e}")))?;
    let host = parsed.host_str().ok_or_else(|| Error::Http(format!("hook url has no host: {url}")))?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);
    let path = match parsed.query() {
        Some(q) => format!("{}?{q}", parsed.path()),
        None => parsed.path().to_string(),
    };

    let body = serde_json::to_vec(event).map_err(|e| Error::Http(e.to_string()))?;
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let head = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let status_line = response.split(|&b| b == b'\n').next().unwrap_or_default();
    let status_code: u16 = String::from_utf8_lossy(status_line)
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok((200..300).contains(&status_code))
}

/// Fires `event` at every url in `urls` in order, stopping at the first
/// non-2xx response. Used for gating actions (connect/publish/play) where a
/// hook may veto the request.
///
/// `urls` is expected to already be an owned clone taken before any `.await`
/// point in the caller, per `spec.md` §4.J: "Hook URLs list is copied before
/// iteration so that reloads during a hook do not invalidate memory."
pub async fn fire_gated(urls: &[String], event: &HookEvent) -> bool {
    for url in urls {
        if !post(url, event).await {
            return false;
        }
    }
    true
}

/// Fires `event` at every url in `urls`, ignoring the response. Used for
/// notification-only actions (stop/unpublish/close).
pub async fn notify_all(urls: &[String], event: &HookEvent) {
    for url in urls {
        let _ = post(url, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(action: &str) -> HookEvent {
        HookEvent {
            action: action.to_string(),
            client_id: "c-1".to_string(),
            ip: "127.0.0.1".to_string(),
            vhost: "__defaultVhost__".to_string(),
            app: "live".to_string(),
            stream: "sr1".to_string(),
            param: String::new(),
            tc_url: "rtmp://localhost/live".to_string(),
            page_url: String::new(),
            duration: None,
        }
    }

    #[tokio::test]
    async fn test_unreachable_hook_reports_not_accepted() {
        // Port 0 connects to nothing reachable; treated as a failed hook.
        let accepted = post("http://127.0.0.1:0/hook", &sample_event("on_connect")).await;
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_fire_gated_stops_at_first_rejection() {
        let urls = vec!["http://127.0.0.1:0/a".to_string(), "http://127.0.0.1:0/b".to_string()];
        assert!(!fire_gated(&urls, &sample_event("on_publish")).await);
    }

    #[tokio::test]
    async fn test_fire_gated_empty_list_accepts() {
        assert!(fire_gated(&[], &sample_event("on_play")).await);
    }
}
