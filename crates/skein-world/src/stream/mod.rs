// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only byte streams with ordered, live delivery.
//!
//! Producers append chunks and close with an EOF marker; readers get every
//! chunk in `chunk_id` order, then termination. A reader attaching
//! mid-stream first drains the table, then follows live notifications,
//! deduplicating by the last emitted chunk id.
//!
//! Live delivery is LISTEN/NOTIFY on PostgreSQL (one dedicated connection
//! dispatching into the in-process [`hub`]) and a per-stream 200 ms table
//! poller on MySQL/SQLite, started with a stream's first reader and
//! stopped with its last.

mod hub;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::DbAdapter;
use crate::config::DatabaseKind;
use crate::error::{Result, WorldError};
use crate::ids;
use crate::storage::{ChunkRecord, Storage};

use self::hub::{ChunkHub, PollerRegistry};

/// PostgreSQL notification channel for chunk writes.
const CHUNK_CHANNEL: &str = "workflow_event_chunk";

/// Poll cadence for back-ends without LISTEN/NOTIFY.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Chunk batch per poll or lag recovery.
const POLL_BATCH: i64 = 100;

/// Reader channel depth before the reader task awaits the consumer.
const READER_BUFFER: usize = 64;

/// The streaming layer.
pub struct Streamer {
    storage: Arc<dyn Storage>,
    adapter: DbAdapter,
    hub: Arc<ChunkHub>,
    pollers: Arc<PollerRegistry>,
    listener_started: tokio::sync::OnceCell<()>,
    shutdown: CancellationToken,
}

impl Streamer {
    /// Create a streamer over the given storage and adapter.
    pub fn new(storage: Arc<dyn Storage>, adapter: DbAdapter) -> Self {
        Self {
            storage,
            adapter,
            hub: Arc::new(ChunkHub::new()),
            pollers: Arc::new(PollerRegistry::new()),
            listener_started: tokio::sync::OnceCell::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Append a chunk of bytes to a stream.
    ///
    /// Writers never observe back-pressure; the queue length is bounded
    /// only by the database.
    pub async fn write_to_stream(&self, stream_id: &str, data: &[u8]) -> Result<()> {
        self.append(stream_id, data, false).await
    }

    /// Close a stream by appending a zero-length EOF marker. Chunks
    /// written after the marker are ignored by readers.
    pub async fn close_stream(&self, stream_id: &str) -> Result<()> {
        self.append(stream_id, &[], true).await
    }

    /// Open a finite, non-restartable reader over a stream.
    ///
    /// `start_index` skips that many data chunks from the front (it counts
    /// chunks, not bytes). The reader yields every subsequent chunk in
    /// order and terminates at the EOF marker. Dropping the reader cancels
    /// it and releases its notifier subscription and any poller it held.
    pub async fn read_from_stream(
        &self,
        stream_id: &str,
        start_index: Option<usize>,
    ) -> Result<StreamReader> {
        self.ensure_listener().await?;

        // Subscribe before the initial table scan so chunks written during
        // the scan are buffered, not lost.
        let hub_rx = self.hub.subscribe(stream_id);

        let polling = self.adapter.kind() != DatabaseKind::Postgres;
        if polling
            && let Some(cancel) = self.pollers.attach(stream_id)
        {
            tokio::spawn(run_stream_poller(
                self.storage.clone(),
                self.hub.clone(),
                stream_id.to_string(),
                cancel,
            ));
        }

        let (tx, rx) = mpsc::channel(READER_BUFFER);
        let cancel = CancellationToken::new();

        let reader = ReaderTask {
            storage: self.storage.clone(),
            stream_id: stream_id.to_string(),
            skip: start_index.unwrap_or(0),
            hub_rx,
            tx,
            cancel: cancel.clone(),
        };
        let pollers = polling.then(|| self.pollers.clone());
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            reader.run().await;
            if let Some(pollers) = pollers {
                pollers.detach(&stream_id);
            }
        });

        Ok(StreamReader { rx, cancel })
    }

    /// Stop the LISTEN dispatcher, if one is running.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn append(&self, stream_id: &str, data: &[u8], eof: bool) -> Result<()> {
        let chunk_id = ids::chunk_id();
        self.storage
            .append_chunk(stream_id, &chunk_id, data, eof)
            .await?;

        match self.adapter.postgres_pool() {
            Some(pool) => {
                // The chunk id cannot contain ':', so the first colon
                // separates it from the (caller-chosen) stream id.
                let payload = format!("{chunk_id}:{stream_id}");
                let result = sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(CHUNK_CHANNEL)
                    .bind(&payload)
                    .execute(pool)
                    .await;
                if let Err(e) = result {
                    warn!(stream_id = %stream_id, error = %e, "chunk NOTIFY failed");
                }
            }
            None => {
                // Same-process readers hear about the write immediately;
                // cross-process readers pick it up from the poller.
                self.hub.publish(
                    stream_id,
                    ChunkRecord {
                        stream_id: stream_id.to_string(),
                        chunk_id,
                        chunk_data: data.to_vec(),
                        eof,
                        created_at: Utc::now(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Start the dedicated LISTEN connection on first use (PostgreSQL
    /// only). It dispatches every chunk notification into the hub.
    async fn ensure_listener(&self) -> Result<()> {
        self.listener_started
            .get_or_try_init(|| async {
                let Some(mut listener) = self.adapter.listener().await? else {
                    return Ok(());
                };
                listener
                    .listen(CHUNK_CHANNEL)
                    .await
                    .map_err(|e| WorldError::database("listen", e))?;

                let storage = self.storage.clone();
                let hub = self.hub.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;

                            _ = shutdown.cancelled() => break,

                            notification = listener.recv() => match notification {
                                Ok(notification) => {
                                    let payload = notification.payload();
                                    let Some((chunk_id, stream_id)) = payload.split_once(':')
                                    else {
                                        continue;
                                    };
                                    match storage.get_chunk(stream_id, chunk_id).await {
                                        Ok(Some(chunk)) => hub.publish(stream_id, chunk),
                                        Ok(None) => {}
                                        Err(e) => {
                                            warn!(
                                                stream_id = %stream_id,
                                                error = %e,
                                                "failed to load notified chunk"
                                            );
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "chunk LISTEN connection dropped, retrying");
                                    sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                    }
                    debug!("chunk LISTEN dispatcher stopped");
                });

                Ok(())
            })
            .await
            .copied()
    }
}

/// Per-stream table poller for back-ends without LISTEN/NOTIFY. Publishes
/// newly visible chunks into the hub until EOF or cancellation.
async fn run_stream_poller(
    storage: Arc<dyn Storage>,
    hub: Arc<ChunkHub>,
    stream_id: String,
    cancel: CancellationToken,
) {
    let mut last_seen = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(POLL_INTERVAL) => {}
        }

        match storage.chunks_after(&stream_id, &last_seen, POLL_BATCH).await {
            Ok(chunks) => {
                let mut saw_eof = false;
                for chunk in chunks {
                    last_seen = chunk.chunk_id.clone();
                    saw_eof |= chunk.eof;
                    hub.publish(&stream_id, chunk);
                }
                if saw_eof {
                    break;
                }
            }
            Err(e) => {
                // Keep the loop alive; the next tick retries.
                warn!(stream_id = %stream_id, error = %e, "stream poll failed");
            }
        }
    }
    debug!(stream_id = %stream_id, "stream poller stopped");
}

struct ReaderTask {
    storage: Arc<dyn Storage>,
    stream_id: String,
    skip: usize,
    hub_rx: broadcast::Receiver<ChunkRecord>,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    cancel: CancellationToken,
}

impl ReaderTask {
    async fn run(mut self) {
        // Phase 1: drain what is already in the table, in order.
        let chunks = match self.storage.list_chunks(&self.stream_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                let _ = self.tx.send(Err(e)).await;
                return;
            }
        };
        let mut last = String::new();
        for chunk in chunks {
            if chunk.eof {
                return;
            }
            last = chunk.chunk_id.clone();
            if !self.emit(chunk.chunk_data).await {
                return;
            }
        }

        // Phase 2: follow the live feed, never re-emitting a chunk at or
        // before the last one seen.
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,

                received = self.hub_rx.recv() => match received {
                    Ok(chunk) => {
                        if chunk.chunk_id <= last {
                            continue;
                        }
                        if chunk.eof {
                            return;
                        }
                        last = chunk.chunk_id.clone();
                        if !self.emit(chunk.chunk_data).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The hub outpaced this reader; recover the gap
                        // from the table.
                        debug!(
                            stream_id = %self.stream_id,
                            missed,
                            "reader lagged, recovering from table"
                        );
                        let chunks = match self
                            .storage
                            .chunks_after(&self.stream_id, &last, POLL_BATCH)
                            .await
                        {
                            Ok(chunks) => chunks,
                            Err(e) => {
                                let _ = self.tx.send(Err(e)).await;
                                return;
                            }
                        };
                        for chunk in chunks {
                            if chunk.eof {
                                return;
                            }
                            last = chunk.chunk_id.clone();
                            if !self.emit(chunk.chunk_data).await {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    /// Send one data chunk to the consumer, honoring the skip count.
    /// Returns false when the consumer is gone.
    async fn emit(&mut self, data: Vec<u8>) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return true;
        }
        self.tx.send(Ok(data)).await.is_ok()
    }
}

/// A finite, ordered byte-chunk stream.
///
/// Yields `Ok(bytes)` per data chunk and ends after the stream's EOF
/// marker. Dropping the reader cancels the underlying task and releases
/// its resources; a cancelled reader cannot be restarted.
pub struct StreamReader {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Receive the next chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        self.rx.recv().await
    }

    /// Collect the remaining chunks into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer)
    }
}

impl tokio_stream::Stream for StreamReader {
    type Item = Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
