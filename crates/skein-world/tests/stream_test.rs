// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streaming integration tests over SQLite (the polling delivery path).

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{NoopExecutor, sqlite_world};

#[tokio::test]
async fn test_write_close_read_in_order() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.write_to_stream("strm-1", b"ab").await.unwrap();
    streamer.write_to_stream("strm-1", b"cd").await.unwrap();
    streamer.close_stream("strm-1").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-1", None).await.unwrap();
    assert_eq!(reader.next_chunk().await.unwrap().unwrap(), b"ab");
    assert_eq!(reader.next_chunk().await.unwrap().unwrap(), b"cd");
    assert!(reader.next_chunk().await.is_none());
}

#[tokio::test]
async fn test_live_delivery_to_attached_reader() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    // Two chunks persisted before the reader attaches.
    streamer.write_to_stream("strm-live", b"ab").await.unwrap();
    streamer.write_to_stream("strm-live", b"cd").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-live", None).await.unwrap();
    let collect = tokio::spawn(async move { reader.read_to_end().await });

    // Written while the reader is live.
    streamer.write_to_stream("strm-live", b"ef").await.unwrap();
    streamer.close_stream("strm-live").await.unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("reader did not terminate")
        .unwrap()
        .unwrap();
    assert_eq!(bytes, b"abcdef");
}

#[tokio::test]
async fn test_reader_sees_each_chunk_exactly_once() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    for i in 0..10u8 {
        streamer.write_to_stream("strm-n", &[i]).await.unwrap();
    }
    streamer.close_stream("strm-n").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-n", None).await.unwrap();
    let mut seen = Vec::new();
    while let Some(chunk) = reader.next_chunk().await {
        seen.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(seen, (0..10u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_start_index_skips_leading_chunks() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.write_to_stream("strm-skip", b"aa").await.unwrap();
    streamer.write_to_stream("strm-skip", b"bb").await.unwrap();
    streamer.write_to_stream("strm-skip", b"cc").await.unwrap();
    streamer.close_stream("strm-skip").await.unwrap();

    let mut reader = streamer
        .read_from_stream("strm-skip", Some(1))
        .await
        .unwrap();
    let bytes = reader.read_to_end().await.unwrap();
    assert_eq!(bytes, b"bbcc");

    // Skipping everything yields an empty, already-terminated stream.
    let mut reader = streamer
        .read_from_stream("strm-skip", Some(3))
        .await
        .unwrap();
    let bytes = reader.read_to_end().await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_close_only_stream_terminates_immediately() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.close_stream("strm-empty").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-empty", None).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(2), reader.next_chunk())
            .await
            .expect("reader did not terminate")
            .is_none()
    );
}

#[tokio::test]
async fn test_two_readers_get_the_same_bytes() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.write_to_stream("strm-two", b"xy").await.unwrap();

    let mut reader_a = streamer.read_from_stream("strm-two", None).await.unwrap();
    let mut reader_b = streamer.read_from_stream("strm-two", None).await.unwrap();
    let collect_a = tokio::spawn(async move { reader_a.read_to_end().await });
    let collect_b = tokio::spawn(async move { reader_b.read_to_end().await });

    streamer.write_to_stream("strm-two", b"z").await.unwrap();
    streamer.close_stream("strm-two").await.unwrap();

    let bytes_a = tokio::time::timeout(Duration::from_secs(5), collect_a)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let bytes_b = tokio::time::timeout(Duration::from_secs(5), collect_b)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(bytes_a, b"xyz");
    assert_eq!(bytes_b, b"xyz");
}

#[tokio::test]
async fn test_dropping_a_reader_releases_the_stream() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.write_to_stream("strm-drop", b"a").await.unwrap();

    // Attach and immediately drop a reader mid-stream.
    let reader = streamer.read_from_stream("strm-drop", None).await.unwrap();
    drop(reader);

    // Writes keep working and a fresh reader still sees everything.
    streamer.write_to_stream("strm-drop", b"b").await.unwrap();
    streamer.close_stream("strm-drop").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-drop", None).await.unwrap();
    let bytes = reader.read_to_end().await.unwrap();
    assert_eq!(bytes, b"ab");
}

#[tokio::test]
async fn test_writes_after_eof_are_ignored_by_readers() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let streamer = ctx.world.streamer();

    streamer.write_to_stream("strm-eof", b"ok").await.unwrap();
    streamer.close_stream("strm-eof").await.unwrap();
    streamer.write_to_stream("strm-eof", b"late").await.unwrap();

    let mut reader = streamer.read_from_stream("strm-eof", None).await.unwrap();
    let bytes = reader.read_to_end().await.unwrap();
    assert_eq!(bytes, b"ok");
}
