//! Commit / Peek / Pop Integration Tests
//!
//! End-to-end coverage of the request pipelines against a real server on a
//! temp directory: ordering, duplicate retries, pops, sequenced peeks, and
//! the lock/stop lifecycle.

use bytes::Bytes;
use std::time::Duration;
use tempfile::TempDir;

use taglog_core::message::{parse_messages, MessageSetBuilder, PeekGroupIter};
use taglog_core::{
    CommitRequest, Error, InitializeRequest, PeekRequest, PopRequest, Tag, Uid, Version,
};
use taglog_storage::{InstanceHandle, TLogConfig, TLogServer};

async fn open_server(dir: &TempDir) -> TLogServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    TLogServer::open(TLogConfig::small_for_tests(dir.path().to_path_buf()))
        .await
        .unwrap()
}

fn commit_req(prev: Version, version: Version, msgs: &[(u32, Vec<Tag>, &[u8])]) -> CommitRequest {
    let mut builder = MessageSetBuilder::new();
    for (sub, tags, payload) in msgs {
        builder.push(*sub, tags, payload);
    }
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

/// Decode a peek reply into `(version, payloads)` groups.
fn decode_payloads(messages: &Bytes) -> Vec<(Version, Vec<Bytes>)> {
    PeekGroupIter::new(messages.clone())
        .map(|group| {
            let (version, framed) = group.unwrap();
            let payloads = framed
                .iter()
                .map(|f| parse_messages(f).unwrap()[0].payload())
                .collect();
            (version, payloads)
        })
        .collect()
}

#[tokio::test]
async fn test_single_tag_commit_and_peek() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"a")]))
        .await
        .unwrap();

    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.end, 11);
    assert_eq!(reply.popped, None);
    assert_eq!(reply.max_known_version, 10);
    let groups = decode_payloads(&reply.messages);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, 10);
    assert_eq!(groups[0].1, vec![Bytes::from_static(b"a")]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pop_discards() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"a")]))
        .await
        .unwrap();
    log.pop(PopRequest {
        tag,
        to: 11,
        durable_known_committed_version: 0,
    })
    .await
    .unwrap();

    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert!(reply.messages.is_empty());
    assert_eq!(reply.end, 11);
    assert_eq!(reply.popped, Some(11));

    // A peek past the popped point serves normally again.
    log.commit(commit_req(10, 12, &[(1, vec![tag], b"b")]))
        .await
        .unwrap();
    let reply = log.peek(peek_req(11, tag)).await.unwrap();
    let groups = decode_payloads(&reply.messages);
    assert_eq!(groups, vec![(12, vec![Bytes::from_static(b"b")])]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_popped_version_never_decreases() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"a")]))
        .await
        .unwrap();
    for to in [11, 5, 11, 2] {
        log.pop(PopRequest {
            tag,
            to,
            durable_known_committed_version: 0,
        })
        .await
        .unwrap();
    }
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.popped, Some(11));

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_commit_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 9, &[(1, vec![tag], b"seed")]))
        .await
        .unwrap();

    // The same commit delivered twice, as a proxy retry would.
    let req = commit_req(9, 10, &[(1, vec![tag], b"once")]);
    log.commit(req.clone()).await.unwrap();
    log.commit(req).await.unwrap();

    let reply = log.peek(peek_req(10, tag)).await.unwrap();
    let groups = decode_payloads(&reply.messages);
    assert_eq!(groups, vec![(10, vec![Bytes::from_static(b"once")])]);
    assert_eq!(reply.end, 11);

    server.shutdown().await;
}

#[tokio::test]
async fn test_commits_apply_in_version_order() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    // Deliver out of order; the later commit must wait for its predecessor.
    let log2 = log.clone();
    let second = tokio::spawn(async move {
        log2.commit(commit_req(10, 11, &[(1, vec![tag], b"second")]))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished());

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"first")]))
        .await
        .unwrap();
    second.await.unwrap().unwrap();

    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    let groups = decode_payloads(&reply.messages);
    assert_eq!(
        groups,
        vec![
            (10, vec![Bytes::from_static(b"first")]),
            (11, vec![Bytes::from_static(b"second")]),
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_peek_after_commit_reply_sees_past_it() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let written = Tag::new(0, 1);
    let silent = Tag::new(0, 2);

    log.commit(commit_req(0, 10, &[(1, vec![written], b"x")]))
        .await
        .unwrap();

    // Even a tag with no messages advances past the committed version.
    let reply = log.peek(peek_req(10, silent)).await.unwrap();
    assert!(reply.end > 10);
    assert!(reply.messages.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_return_if_blocked() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    let err = log
        .peek(PeekRequest {
            begin: 100,
            tag,
            return_if_blocked: true,
            only_spilled: false,
            sequence: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EndOfStream));

    server.shutdown().await;
}

#[tokio::test]
async fn test_multiple_messages_and_tags_in_one_commit() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let t1 = Tag::new(0, 1);
    let t2 = Tag::new(0, 2);

    log.commit(commit_req(
        0,
        10,
        &[
            (1, vec![t1], b"only-one"),
            (2, vec![t1, t2], b"both"),
            (3, vec![t2], b"only-two"),
        ],
    ))
    .await
    .unwrap();

    let reply = log.peek(peek_req(0, t1)).await.unwrap();
    let groups = decode_payloads(&reply.messages);
    assert_eq!(
        groups,
        vec![(
            10,
            vec![Bytes::from_static(b"only-one"), Bytes::from_static(b"both")]
        )]
    );

    let reply = log.peek(peek_req(0, t2)).await.unwrap();
    let groups = decode_payloads(&reply.messages);
    assert_eq!(
        groups,
        vec![(
            10,
            vec![Bytes::from_static(b"both"), Bytes::from_static(b"only-two")]
        )]
    );

    server.shutdown().await;
}

async fn sequenced_peek(
    log: &InstanceHandle,
    peer: Uid,
    seq: i32,
    begin: Version,
    tag: Tag,
) -> taglog_core::PeekReply {
    log.peek(PeekRequest {
        begin,
        tag,
        return_if_blocked: false,
        only_spilled: false,
        sequence: Some((peer, seq)),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_sequenced_peeks_chain_in_order() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);
    let peer = Uid::random();

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"v10")]))
        .await
        .unwrap();

    // Sequence 0 goes through immediately.
    let reply0 = sequenced_peek(&log, peer, 0, 0, tag).await;
    assert_eq!(reply0.end, 11);

    // Sequences 2 then 1 arrive out of order; each blocks until its
    // predecessor's cursor is known.
    let log_for_2 = log.clone();
    let seq2 = tokio::spawn(async move { sequenced_peek(&log_for_2, peer, 2, 0, tag).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let log_for_1 = log.clone();
    let seq1 = tokio::spawn(async move { sequenced_peek(&log_for_1, peer, 1, 0, tag).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!seq1.is_finished());
    assert!(!seq2.is_finished());

    log.commit(commit_req(10, 11, &[(1, vec![tag], b"v11")]))
        .await
        .unwrap();
    let reply1 = seq1.await.unwrap();
    assert_eq!(reply1.begin, Some(reply0.end));
    assert_eq!(reply1.end, 12);

    log.commit(commit_req(11, 12, &[(1, vec![tag], b"v12")]))
        .await
        .unwrap();
    let reply2 = seq2.await.unwrap();
    assert_eq!(reply2.begin, Some(reply1.end));
    assert_eq!(reply2.end, 13);

    server.shutdown().await;
}

#[tokio::test]
async fn test_sequence_behind_window_times_out() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);
    let peer = Uid::random();

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"x")]))
        .await
        .unwrap();
    sequenced_peek(&log, peer, 0, 0, tag).await;

    // A stale sequence far behind the pipeline window is rejected.
    let err = log
        .peek(PeekRequest {
            begin: 0,
            tag,
            return_if_blocked: false,
            only_spilled: false,
            sequence: Some((peer, -100)),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TimedOut));

    server.shutdown().await;
}

#[tokio::test]
async fn test_lock_stops_commits_and_drains() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"x")]))
        .await
        .unwrap();

    let lock = log.lock().await.unwrap();
    assert_eq!(lock.end, 10);

    let err = log
        .commit(commit_req(10, 11, &[(1, vec![tag], b"y")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Stopped));
    assert!(matches!(log.confirm_running(None), Err(Error::Stopped)));

    // Peeks still serve the drained data.
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(decode_payloads(&reply.messages).len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_recruitment_stops_previous_generation() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let gen1 = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    gen1.commit(commit_req(0, 10, &[(1, vec![tag], b"old")]))
        .await
        .unwrap();

    let gen2 = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    assert!(gen1.is_stopped());
    assert!(!gen2.is_stopped());

    let err = gen1
        .commit(commit_req(10, 11, &[(1, vec![tag], b"rejected")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Stopped));

    gen2.commit(commit_req(0, 20, &[(1, vec![tag], b"new")]))
        .await
        .unwrap();
    let reply = gen2.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(
        decode_payloads(&reply.messages),
        vec![(20, vec![Bytes::from_static(b"new")])]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_ignore_pop_gate_buffers_and_replays() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);
    let operator = Uid::random();

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"x")]))
        .await
        .unwrap();

    log.disable_pops(operator);
    log.pop(PopRequest {
        tag,
        to: 11,
        durable_known_committed_version: 0,
    })
    .await
    .unwrap();

    // Gate armed: the pop is buffered, data still visible.
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.popped, None);
    assert_eq!(decode_payloads(&reply.messages).len(), 1);

    log.enable_pops(operator).await.unwrap();
    let reply = log.peek(peek_req(0, tag)).await.unwrap();
    assert_eq!(reply.popped, Some(11));
    assert!(reply.messages.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_remove_tears_down_instance() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    log.commit(commit_req(0, 10, &[(1, vec![tag], b"x")]))
        .await
        .unwrap();

    let watcher = log.clone();
    log.remove().await.unwrap();
    assert!(matches!(watcher.removed().await, Error::WorkerRemoved));

    server.shutdown().await;
}

#[tokio::test]
async fn test_queuing_metrics_reflect_input() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir).await;
    let log = server.recruit(InitializeRequest::fresh(0)).await.unwrap();
    let tag = Tag::new(0, 1);

    let before = log.queuing_metrics();
    log.commit(commit_req(0, 10, &[(1, vec![tag], &[7u8; 512])]))
        .await
        .unwrap();
    let after = log.queuing_metrics();

    assert!(after.bytes_input > before.bytes_input);
    assert!(after.bytes_durable <= after.bytes_input);
    assert_eq!(after.instance_id, before.instance_id);

    server.shutdown().await;
}
