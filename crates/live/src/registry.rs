// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The source registry: one actor owning `key → SourceHandle`, so
//! fetch-or-create is a single logical operation with no intermediate
//! `.await` that could let two publishers race into creating duplicate
//! sources for the same key (`spec.md` §4.H, §5 "Shared resources").

use crate::source::{self, SourceHandle};
use rtmpkit_core::types::StreamKey;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

enum RegistryCommand {
    GetOrCreate { key: StreamKey, gop_enabled: bool, resp: oneshot::Sender<SourceHandle> },
    Get { key: StreamKey, resp: oneshot::Sender<Option<SourceHandle>> },
}

/// Cloneable handle to the running registry actor.
#[derive(Clone)]
pub struct SourceRegistry {
    tx: mpsc::Sender<RegistryCommand>,
}

impl SourceRegistry {
    /// Spawns the registry actor.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let (evict_tx, evict_rx) = mpsc::channel(256);
        tokio::spawn(run(rx, evict_tx, evict_rx));
        Self { tx }
    }

    /// Looks up or creates the source for `key`, atomically.
    pub async fn get_or_create(&self, key: StreamKey, gop_enabled: bool) -> SourceHandle {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::GetOrCreate { key, gop_enabled, resp }).await.is_err() {
            unreachable!("registry actor outlives all its handles");
        }
        rx.await.expect("registry actor never drops a pending GetOrCreate response")
    }

    /// Looks up an existing source without creating one.
    pub async fn get(&self, key: StreamKey) -> Option<SourceHandle> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Get { key, resp }).await.ok()?;
        rx.await.ok().flatten()
    }
}

async fn run(mut rx: mpsc::Receiver<RegistryCommand>, evict_tx: mpsc::Sender<StreamKey>, mut evict_rx: mpsc::Receiver<StreamKey>) {
    let mut sources: HashMap<StreamKey, SourceHandle> = HashMap::new();
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    RegistryCommand::GetOrCreate { key, gop_enabled, resp } => {
                        let handle = sources
                            .entry(key.clone())
                            .or_insert_with(|| source::spawn(key, gop_enabled, evict_tx.clone()))
                            .clone();
                        let _ = resp.send(handle);
                    },
                    RegistryCommand::Get { key, resp } => {
                        let _ = resp.send(sources.get(&key).cloned());
                    },
                }
            },
            Some(key) = evict_rx.recv() => {
                sources.remove(&key);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stream: &str) -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", stream)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_per_key() {
        let registry = SourceRegistry::spawn();
        let first = registry.get_or_create(key("sr1"), true).await;
        let second = registry.get_or_create(key("sr1"), true).await;
        first.acquire_publish(false, None).await.unwrap();
        // Same underlying actor: the handle obtained from the second lookup
        // already observes the publish the first handle started.
        let err = second.acquire_publish(false, None).await.unwrap_err();
        assert!(matches!(err, rtmpkit_core::error::Error::Stream(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_sources() {
        let registry = SourceRegistry::spawn();
        let a = registry.get_or_create(key("sr1"), true).await;
        let b = registry.get_or_create(key("sr2"), true).await;
        a.acquire_publish(false, None).await.unwrap();
        // A publish on "sr1" must not block a publish on "sr2".
        b.acquire_publish(false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_without_create_returns_none_for_unknown_key() {
        let registry = SourceRegistry::spawn();
        assert!(registry.get(key("never-published")).await.is_none());
        registry.get_or_create(key("sr1"), true).await;
        assert!(registry.get(key("sr1")).await.is_some());
    }
}
