// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared, cheaply-`Clone`-able server state handed to every accepted
//! connection's task.
//!
//! [`rtmpkit_live::SourceRegistry`] is already its own actor (fetch-or-create
//! happens on one task with no intermediate yield), so it's `Clone` on its
//! own. [`rtmpkit_core::stats::Statistics`] is a plain struct with no
//! internal synchronization, so unlike the registry it needs an explicit
//! `Mutex` here to be shared across the one-task-per-connection model.

use crate::config::Config;
use rtmpkit_core::stats::Statistics;
use rtmpkit_http::{AudioTapRegistry, MountRegistry, DEFAULT_AUDIO_REPLAY_SPAN_MS};
use rtmpkit_live::SourceRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a connection task needs beyond its own socket: configuration,
/// the live source hub, shared statistics, and (when HTTP egress is
/// enabled) the mount registry and its audio-only replay taps.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sources: SourceRegistry,
    pub stats: Arc<Mutex<Statistics>>,
    pub mounts: Arc<MountRegistry>,
    pub audio_taps: Arc<AudioTapRegistry>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mounts = MountRegistry::new(&config.http.mounts);
        Self {
            config: Arc::new(config),
            sources: SourceRegistry::spawn(),
            stats: Arc::new(Mutex::new(Statistics::new())),
            mounts: Arc::new(mounts),
            audio_taps: Arc::new(AudioTapRegistry::new(DEFAULT_AUDIO_REPLAY_SPAN_MS)),
        }
    }
}
