// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Top-level server bootstrap: builds the shared [`AppState`], binds the
//! RTMP listener (and the HTTP egress listener, if configured), and spawns
//! one task per accepted connection.

use crate::config::Config;
use crate::state::AppState;
use crate::{conn, egress};
use rtmpkit_core::error::Result;
use tokio::net::TcpListener;

/// Runs the server until the RTMP listener fails; the HTTP egress listener
/// (when enabled) runs alongside it for the lifetime of the process.
///
/// # Errors
/// Returns an error if the RTMP listener cannot be bound.
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::new(config);

    if let Some(http_listen) = state.config.http.listen.clone() {
        let http_state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = egress::serve(&http_listen, http_state).await {
                tracing::error!(%error, "http egress listener exited");
            }
        });
    }

    let listener = TcpListener::bind(&state.config.rtmp.listen).await?;
    tracing::info!(listen = %state.config.rtmp.listen, "rtmp listener bound");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(conn::handle(stream, peer_addr, state));
    }
}
