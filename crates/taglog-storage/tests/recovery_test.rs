//! Recovery Integration Tests
//!
//! Crash-and-restart scenarios against a real data directory: torn queue
//! tails, restart-identical peeks, popped-state restoration, and fresh
//! installs.

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use taglog_core::message::{parse_messages, MessageSetBuilder, PeekGroupIter};
use taglog_core::{CommitRequest, Error, InitializeRequest, PeekRequest, PopRequest, Tag, Version};
use taglog_storage::{InstanceHandle, TLogConfig, TLogServer};

async fn open_server(dir: &Path) -> TLogServer {
    TLogServer::open(TLogConfig::small_for_tests(dir.to_path_buf()))
        .await
        .unwrap()
}

fn commit_req(prev: Version, version: Version, tag: Tag, payload: &[u8]) -> CommitRequest {
    let mut builder = MessageSetBuilder::new();
    builder.push(1, &[tag], payload);
    CommitRequest {
        prev_version: prev,
        version,
        known_committed_version: prev,
        min_known_committed_version: 0,
        messages: builder.build(),
        has_exec_op: false,
        debug_id: None,
    }
}

fn peek_req(begin: Version, tag: Tag) -> PeekRequest {
    PeekRequest {
        begin,
        tag,
        return_if_blocked: false,
        only_spilled: false,
        sequence: None,
    }
}

fn decode_payloads(messages: &Bytes) -> Vec<(Version, Bytes)> {
    PeekGroupIter::new(messages.clone())
        .flat_map(|group| {
            let (version, framed) = group.unwrap();
            framed
                .into_iter()
                .map(move |f| (version, parse_messages(&f).unwrap()[0].payload()))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn test_fresh_install_has_no_instances() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path()).await;
    assert!(server.recovered_instances().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_committed_data() {
    let dir = TempDir::new().unwrap();
    let tag = Tag::new(0, 1);

    let pre_crash_reply;
    {
        let server = open_server(dir.path()).await;
        let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
        log.commit(commit_req(0, 10, tag, b"alpha")).await.unwrap();
        log.commit(commit_req(10, 11, tag, b"beta")).await.unwrap();
        pre_crash_reply = log.peek(peek_req(0, tag)).await.unwrap();
        server.shutdown().await;
    }

    let server = open_server(dir.path()).await;
    let recovered = server.recovered_instances();
    assert_eq!(recovered.len(), 1);
    let log = &recovered[0];
    assert!(log.is_stopped());
    assert_eq!(log.version(), 11);

    // Replayed state answers peeks identically to the pre-crash state.
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.messages, pre_crash_reply.messages);
    assert_eq!(reply.end, pre_crash_reply.end);
    assert_eq!(
        decode_payloads(&reply.messages),
        vec![
            (10, Bytes::from_static(b"alpha")),
            (11, Bytes::from_static(b"beta"))
        ]
    );

    // A recovered generation never accepts new commits.
    let err = log.commit(commit_req(11, 12, tag, b"late")).await.unwrap_err();
    assert!(matches!(err, Error::Stopped));

    server.shutdown().await;
}

#[tokio::test]
async fn test_torn_queue_tail_is_repaired() {
    let dir = TempDir::new().unwrap();
    let tag = Tag::new(0, 1);

    {
        let server = open_server(dir.path()).await;
        let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
        log.commit(commit_req(0, 10, tag, b"alpha")).await.unwrap();
        log.commit(commit_req(10, 11, tag, b"beta")).await.unwrap();
        server.shutdown().await;
    }

    // Simulate a crash mid-push: a few bytes of a record made it to disk.
    {
        let mut wal = tokio::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("taglog.wal"))
            .await
            .unwrap();
        wal.write_all(&[0x40, 0x00]).await.unwrap();
        wal.sync_all().await.unwrap();
    }

    // First restart repairs the tail and serves the intact records.
    {
        let server = open_server(dir.path()).await;
        let recovered = server.recovered_instances();
        assert_eq!(recovered.len(), 1);
        let reply = recovered[0].peek(peek_req(0, tag)).await.unwrap();
        assert_eq!(
            decode_payloads(&reply.messages),
            vec![
                (10, Bytes::from_static(b"alpha")),
                (11, Bytes::from_static(b"beta"))
            ]
        );
        server.shutdown().await;
    }

    // Repair is idempotent: a second restart replays cleanly.
    {
        let server = open_server(dir.path()).await;
        let reply = server.recovered_instances()[0]
            .peek(peek_req(0, tag))
            .await
            .unwrap();
        assert_eq!(decode_payloads(&reply.messages).len(), 2);
        server.shutdown().await;
    }
}

async fn commit_bulk(log: &InstanceHandle, tag: Tag, first: Version, count: i64) {
    let mut prev = if first == 10 { 0 } else { first - 1 };
    for version in first..first + count {
        let mut payload = vec![(version % 97) as u8; 1024];
        payload[..8].copy_from_slice(&version.to_le_bytes());
        let mut builder = MessageSetBuilder::new();
        builder.push(1, &[tag], &payload);
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
    panic!("spill never reached version {at_least}");
}

#[tokio::test]
async fn test_restart_after_spill_serves_full_stream() {
    let dir = TempDir::new().unwrap();
    let tag = Tag::new(0, 2);

    let committed_through;
    {
        let server = open_server(dir.path()).await;
        let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
        commit_bulk(&log, tag, 10, 100).await;
        committed_through = log.version();
        wait_for_spill(&log, 40).await;
        server.shutdown().await;
    }

    let server = open_server(dir.path()).await;
    let recovered = server.recovered_instances();
    assert_eq!(recovered.len(), 1);
    let log = &recovered[0];

    // Walk the whole stream across spilled rows and replayed memory.
    let mut begin = 0;
    let mut expected = 10;
    while begin < committed_through + 1 {
        let reply = log.peek(peek_req(begin, tag)).await.unwrap();
        for (version, payload) in decode_payloads(&reply.messages) {
            assert_eq!(version, expected);
            assert_eq!(payload[..8], version.to_le_bytes());
            expected += 1;
        }
        assert!(reply.end > begin);
        begin = reply.end;
    }
    assert_eq!(expected, committed_through + 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_popped_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let tag = Tag::new(0, 2);
    let pop_to = 60;

    {
        let server = open_server(dir.path()).await;
        let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
        commit_bulk(&log, tag, 10, 60).await;
        wait_for_spill(&log, 30).await;
        log.pop(PopRequest {
            tag,
            to: pop_to,
            durable_known_committed_version: 0,
        })
        .await
        .unwrap();
        // The popped watermark only becomes durable with the next spill
        // commit; feed it more data and wait.
        commit_bulk(&log, tag, 70, 60).await;
        wait_for_spill(&log, 90).await;
        server.shutdown().await;
    }

    let server = open_server(dir.path()).await;
    let log = &server.recovered_instances()[0];
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.popped, Some(pop_to));
    assert_eq!(reply.end, pop_to);
    assert!(reply.messages.is_empty());

    // Data from the popped point onward is all there.
    let reply = log.peek(peek_req(pop_to, tag)).await.unwrap();
    let decoded = decode_payloads(&reply.messages);
    assert!(!decoded.is_empty());
    assert_eq!(decoded[0].0, pop_to);
    assert!(decoded.iter().all(|(v, _)| *v >= pop_to));

    server.shutdown().await;
}

#[tokio::test]
async fn test_recovered_generation_coexists_with_new_one() {
    let dir = TempDir::new().unwrap();
    let tag = Tag::new(0, 1);

    {
        let server = open_server(dir.path()).await;
        let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
        log.commit(commit_req(0, 10, tag, b"old-gen")).await.unwrap();
        server.shutdown().await;
    }

    let server = open_server(dir.path()).await;
    let old = server.recovered_instances()[0].clone();

    let new = server
        .recruit(InitializeRequest {
            recovering: true,
            start_version: 20,
            recover_at: 20,
            known_committed_version: 11,
            all_tags: vec![tag],
            ..InitializeRequest::fresh(0)
        })
        .await
        .unwrap();

    // Both generations answer peeks from the shared queue and store.
    let reply = old.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(
        decode_payloads(&reply.messages),
        vec![(10, Bytes::from_static(b"old-gen"))]
    );

    new.commit(commit_req(20, 21, tag, b"new-gen")).await.unwrap();
    let reply = new.peek(peek_req(21, tag)).await.unwrap();
    assert_eq!(
        decode_payloads(&reply.messages),
        vec![(21, Bytes::from_static(b"new-gen"))]
    );

    server.shutdown().await;
}
