//! Spill Pipeline Integration Tests
//!
//! Drives the server past its (test-sized) spill threshold and verifies
//! that spilled data reads back byte-identical through the peek pipeline:
//! by reference for ordinary tags, by value for the system-transaction tag.

use bytes::Bytes;
use std::time::Duration;
use tempfile::TempDir;

use taglog_core::message::{parse_messages, MessageSetBuilder, PeekGroupIter};
use taglog_core::{CommitRequest, InitializeRequest, PeekRequest, PopRequest, Tag, Version};
use taglog_storage::{InstanceHandle, TLogConfig, TLogServer};

const FIRST_VERSION: Version = 10;
const VERSION_COUNT: i64 = 100;
const PAYLOAD_LEN: usize = 1024;

async fn open_server(dir: &TempDir) -> TLogServer {
    TLogServer::open(TLogConfig::small_for_tests(dir.path().to_path_buf()))
        .await
        .unwrap()
}

/// A distinct, recognizable payload per version.
fn payload_for(version: Version) -> Vec<u8> {
    let mut p = vec![(version % 251) as u8; PAYLOAD_LEN];
    p[..8].copy_from_slice(&version.to_le_bytes());
    p
}

async fn commit_stream(log: &InstanceHandle, tag: Tag, first: Version, count: i64) {
    let mut prev = if first == FIRST_VERSION { 0 } else { first - 1 };
    for version in first..first + count {
        let mut builder = MessageSetBuilder::new();
        builder.push(1, &[tag], &payload_for(version));
        log.commit(CommitRequest {
            prev_version: prev,
            version,
            known_committed_version: prev,
            min_known_committed_version: 0,
            messages: builder.build(),
            has_exec_op: false,
            debug_id: None,
        })
        .await
        .unwrap();
        prev = version;
    }
}

async fn wait_for_spill(log: &InstanceHandle, at_least: Version) {
    for _ in 0..500 {
        if log.persistent_data_durable_version() >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "spill never reached version {at_least}; persistent_data_durable_version = {}",
        log.persistent_data_durable_version()
    );
}

/// Drain `(version, payload)` pairs from peeks starting at `begin` until
/// `end_at` is reached.
async fn collect_stream(
    log: &InstanceHandle,
    tag: Tag,
    mut begin: Version,
    end_at: Version,
) -> Vec<(Version, Bytes)> {
    let mut out = Vec::new();
    loop {
        let reply = log
            .peek(PeekRequest {
                begin,
                tag,
                return_if_blocked: false,
                only_spilled: false,
                sequence: None,
            })
            .await
            .unwrap();
        for group in PeekGroupIter::new(reply.messages.clone()) {
            let (version, framed) = group.unwrap();
            for f in framed {
                out.push((version, parse_messages(&f).unwrap()[0].payload()));
            }
        }
        assert!(reply.end > begin, "peek cursor must advance");
        begin = reply.end;
        if begin >= end_at {
            return out;
        }
    }
}

#[tokio::test]
async fn test_spill_by_reference_round_trip() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 2);

    commit_stream(&log, tag, FIRST_VERSION, VERSION_COUNT).await;
    wait_for_spill(&log, FIRST_VERSION + VERSION_COUNT / 2).await;

    // Only-spilled peek: everything up to the durable boundary, nothing
    // from memory.
    let reply = log
        .peek(PeekRequest {
            begin: 0,
            tag,
            return_if_blocked: false,
            only_spilled: true,
            sequence: None,
        })
        .await
        .unwrap();
    assert!(reply.end > FIRST_VERSION + 1);

    let mut versions_seen = Vec::new();
    for group in PeekGroupIter::new(reply.messages.clone()) {
        let (version, framed) = group.unwrap();
        assert_eq!(framed.len(), 1);
        assert_eq!(
            parse_messages(&framed[0]).unwrap()[0].payload(),
            Bytes::from(payload_for(version)),
            "spilled payload for version {version} corrupted"
        );
        versions_seen.push(version);
    }
    assert_eq!(versions_seen.first(), Some(&FIRST_VERSION));
    assert!(versions_seen.windows(2).all(|w| w[0] < w[1]));

    // The full stream (spilled + memory) is intact and complete.
    let stream = collect_stream(&log, tag, 0, FIRST_VERSION + VERSION_COUNT).await;
    assert_eq!(stream.len() as i64, VERSION_COUNT);
    for (i, (version, payload)) in stream.iter().enumerate() {
        assert_eq!(*version, FIRST_VERSION + i as i64);
        assert_eq!(*payload, Bytes::from(payload_for(*version)));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_spill_by_value_for_txs_tag() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();

    commit_stream(&log, Tag::TXS, FIRST_VERSION, VERSION_COUNT).await;
    wait_for_spill(&log, FIRST_VERSION + VERSION_COUNT / 2).await;

    let stream = collect_stream(&log, Tag::TXS, 0, FIRST_VERSION + VERSION_COUNT).await;
    assert_eq!(stream.len() as i64, VERSION_COUNT);
    for (i, (version, payload)) in stream.iter().enumerate() {
        assert_eq!(*version, FIRST_VERSION + i as i64);
        assert_eq!(*payload, Bytes::from(payload_for(*version)));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_pop_after_spill_discards_spilled_rows() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 2);

    commit_stream(&log, tag, FIRST_VERSION, VERSION_COUNT).await;
    wait_for_spill(&log, FIRST_VERSION + VERSION_COUNT / 2).await;

    let pop_to = FIRST_VERSION + 30;
    log.pop(PopRequest {
        tag,
        to: pop_to,
        durable_known_committed_version: 0,
    })
    .await
    .unwrap();

    // Nothing below the popped point comes back, spilled or not.
    let stream = collect_stream(&log, tag, pop_to, FIRST_VERSION + VERSION_COUNT).await;
    assert_eq!(stream.len() as i64, VERSION_COUNT - 30);
    assert_eq!(stream[0].0, pop_to);

    let reply = log
        .peek(PeekRequest {
            begin: 0,
            tag,
            return_if_blocked: false,
            only_spilled: false,
            sequence: None,
        })
        .await
        .unwrap();
    assert_eq!(reply.popped, Some(pop_to));
    assert!(reply.messages.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_spilled_and_memory_batches_concatenate() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 3);

    commit_stream(&log, tag, FIRST_VERSION, VERSION_COUNT).await;
    wait_for_spill(&log, FIRST_VERSION + VERSION_COUNT / 2).await;
    let boundary = log.persistent_data_durable_version();
    assert!(boundary < FIRST_VERSION + VERSION_COUNT - 1);

    // A single peek spanning the boundary returns one seamless stream.
    let reply = log
        .peek(PeekRequest {
            begin: boundary - 5,
            tag,
            return_if_blocked: false,
            only_spilled: false,
            sequence: None,
        })
        .await
        .unwrap();
    let mut expected = boundary - 5;
    for group in PeekGroupIter::new(reply.messages.clone()) {
        let (version, _) = group.unwrap();
        assert_eq!(version, expected);
        expected += 1;
    }
    assert!(expected > boundary, "peek never crossed the spill boundary");

    server.shutdown().await;
}
