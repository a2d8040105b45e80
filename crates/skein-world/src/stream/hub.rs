// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local chunk fan-out.
//!
//! The hub keeps one broadcast channel per stream id with active readers.
//! Writers (and the LISTEN dispatcher / table pollers) publish into it;
//! readers subscribe before their initial table scan so nothing written
//! during the scan is lost. Delivery is dedup'd by chunk id on the reader
//! side, so an overlap between the scan and the live feed is harmless.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::storage::ChunkRecord;

const HUB_CHANNEL_CAPACITY: usize = 256;

/// Per-stream broadcast hub.
#[derive(Default)]
pub(crate) struct ChunkHub {
    streams: Mutex<HashMap<String, broadcast::Sender<ChunkRecord>>>,
}

impl ChunkHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Subscribe to live chunks for a stream, creating the channel on
    /// first use.
    pub(crate) fn subscribe(&self, stream_id: &str) -> broadcast::Receiver<ChunkRecord> {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a chunk to any live subscribers. A stream whose last
    /// subscriber has gone is pruned from the map.
    pub(crate) fn publish(&self, stream_id: &str, chunk: ChunkRecord) {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = streams.get(stream_id)
            && sender.send(chunk).is_err()
        {
            streams.remove(stream_id);
        }
    }
}

struct PollerEntry {
    readers: usize,
    cancel: CancellationToken,
}

/// Tracks the per-stream table pollers used on back-ends without
/// LISTEN/NOTIFY. A poller is started when the first reader of a stream
/// attaches and cancelled when the last one detaches.
#[derive(Default)]
pub(crate) struct PollerRegistry {
    inner: Mutex<HashMap<String, PollerEntry>>,
}

impl PollerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a reader. Returns a cancellation token exactly when this
    /// reader is the first for the stream and a poller must be spawned.
    pub(crate) fn attach(&self, stream_id: &str) -> Option<CancellationToken> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.entry(stream_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().readers += 1;
                None
            }
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                entry.insert(PollerEntry {
                    readers: 1,
                    cancel: cancel.clone(),
                });
                Some(cancel)
            }
        }
    }

    /// Deregister a reader; the poller is cancelled with the last one.
    pub(crate) fn detach(&self, stream_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = inner.get_mut(stream_id) {
            entry.readers = entry.readers.saturating_sub(1);
            if entry.readers == 0 {
                entry.cancel.cancel();
                inner.remove(stream_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(stream_id: &str, chunk_id: &str) -> ChunkRecord {
        ChunkRecord {
            stream_id: stream_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_data: b"data".to_vec(),
            eof: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_hub_delivers_to_subscriber() {
        let hub = ChunkHub::new();
        let mut rx = hub.subscribe("strm-1");
        hub.publish("strm-1", chunk("strm-1", "chnk_01A"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.chunk_id, "chnk_01A");
    }

    #[tokio::test]
    async fn test_hub_isolates_streams() {
        let hub = ChunkHub::new();
        let mut rx_a = hub.subscribe("strm-a");
        let _rx_b = hub.subscribe("strm-b");
        hub.publish("strm-b", chunk("strm-b", "chnk_01B"));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = ChunkHub::new();
        hub.publish("strm-1", chunk("strm-1", "chnk_01A"));
    }

    #[test]
    fn test_poller_registry_counts_readers() {
        let registry = PollerRegistry::new();

        let token = registry.attach("strm-1");
        assert!(token.is_some(), "first reader starts the poller");
        assert!(registry.attach("strm-1").is_none(), "second reader shares it");

        let token = token.unwrap();
        registry.detach("strm-1");
        assert!(!token.is_cancelled(), "one reader still attached");
        registry.detach("strm-1");
        assert!(token.is_cancelled(), "last reader cancels the poller");

        // A fresh reader starts a fresh poller.
        assert!(registry.attach("strm-1").is_some());
    }
}
