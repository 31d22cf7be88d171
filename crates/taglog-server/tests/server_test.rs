//! End-to-end log server scenarios: commit/peek/pop flows, sequenced
//! peeks, crash recovery, spilling, locking and recruitment handoff.

use std::time::Duration;

use bytes::Bytes;
use taglog_core::{CommitBatchBuilder, PeekBodyReader, Tag, Uid, Version};
use taglog_net::{Token, Transport, TransportConfig};
use taglog_server::client::{recruit, TLogClient};
use taglog_server::rpc::{RecoverFrom, RecruitRequest};
use taglog_server::{Error, ServerConfig, TLogServer};
use tempfile::TempDir;

const T: Tag = Tag::new(0, 7);

fn one_message(tags: &[Tag], payload: &[u8]) -> Bytes {
    let mut batch = CommitBatchBuilder::new();
    batch.append(tags, payload);
    batch.finish()
}

fn decode(reply_messages: Bytes) -> Vec<(Version, Vec<u8>)> {
    PeekBodyReader::new(reply_messages)
        .map(|r| {
            let (version, message) = r.unwrap();
            (version, message.payload.to_vec())
        })
        .collect()
}

async fn client_transport() -> Transport {
    Transport::bind(TransportConfig::default(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

async fn recruit_fresh(
    transport: &Transport,
    server: &TLogServer,
    epoch: u64,
) -> TLogClient {
    let (addr, token) = server.recruit_endpoint();
    let interface = recruit(
        transport,
        addr,
        token,
        |reply| RecruitRequest {
            reply,
            recruitment_id: Uid::random(),
            epoch,
            locality: 0,
            log_router_tags: 0,
            known_committed_version: 0,
            recover_at: 0,
            recover_tags: Vec::new(),
            recover_from: None,
        },
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    TLogClient::new(transport.clone(), interface)
}

async fn start_server(dir: &TempDir) -> TLogServer {
    TLogServer::start(
        ServerConfig::new(dir.path()),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap()
}

/// Commit `("a", 10) ("b", 11) ("c", 12)` for tag `T`.
async fn commit_abc(client: &TLogClient) {
    let mut prev = 0;
    for (version, payload) in [(10u64, b"a"), (11, b"b"), (12, b"c")] {
        client
            .commit(
                prev,
                version,
                version.saturating_sub(1),
                one_message(&[T], payload),
                false,
            )
            .await
            .unwrap();
        prev = version;
    }
}

#[tokio::test]
async fn test_commit_and_peek_one_tag() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    commit_abc(&client).await;

    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(reply.end, 13);
    assert_eq!(reply.popped, None);
    assert_eq!(reply.begin, 10);
    assert_eq!(reply.max_known_version, 12);
    assert_eq!(
        decode(reply.messages),
        vec![
            (10, b"a".to_vec()),
            (11, b"b".to_vec()),
            (12, b"c".to_vec())
        ]
    );
}

#[tokio::test]
async fn test_pop_trims_memory() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    commit_abc(&client).await;
    client.pop(T, 12).await.unwrap();

    // Everything below the popped version is gone; the reply reports the
    // pop so the subscriber can restart its cursor from there.
    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(reply.popped, Some(12));
    assert_eq!(reply.end, 12);
    assert!(reply.messages.is_empty());

    // From the popped version onward, data still flows.
    let reply = client.peek(T, 12).await.unwrap();
    assert_eq!(reply.popped, None);
    assert_eq!(decode(reply.messages), vec![(12, b"c".to_vec())]);
    assert_eq!(reply.end, 13);
}

#[tokio::test]
async fn test_restart_recovers_from_queue_replay() {
    let dir = TempDir::new().unwrap();
    {
        let server = start_server(&dir).await;
        let transport = client_transport().await;
        let client = recruit_fresh(&transport, &server, 1).await;
        commit_abc(&client).await;
        server.shutdown();
    }

    let server = start_server(&dir).await;
    let interfaces = server.interfaces().await;
    assert_eq!(interfaces.len(), 1);
    let transport = client_transport().await;
    let client = TLogClient::new(transport, interfaces[0].clone());

    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(
        decode(reply.messages),
        vec![
            (10, b"a".to_vec()),
            (11, b"b".to_vec()),
            (12, b"c".to_vec())
        ]
    );
    assert_eq!(reply.end, 13);
}

#[tokio::test]
async fn test_restart_recovers_spilled_data() {
    let dir = TempDir::new().unwrap();
    {
        let server = start_server(&dir).await;
        let transport = client_transport().await;
        let client = recruit_fresh(&transport, &server, 1).await;
        commit_abc(&client).await;
        // Push everything into the KV index before the "crash".
        server.force_spill().await.unwrap();
        server.shutdown();
    }

    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let interfaces = server.interfaces().await;
    let client = TLogClient::new(transport, interfaces[0].clone());

    // Served by resolving spilled references back through the queue.
    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(
        decode(reply.messages),
        vec![
            (10, b"a".to_vec()),
            (11, b"b".to_vec()),
            (12, b"c".to_vec())
        ]
    );
}

#[tokio::test]
async fn test_spilled_peek_reads_references() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    commit_abc(&client).await;
    server.force_spill().await.unwrap();

    // No restart: spilled and in-memory paths must agree.
    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(
        decode(reply.messages),
        vec![
            (10, b"a".to_vec()),
            (11, b"b".to_vec()),
            (12, b"c".to_vec())
        ]
    );

    let only_spilled = client.peek_full(T, 10, false, true, None).await.unwrap();
    assert_eq!(
        decode(only_spilled.messages),
        vec![
            (10, b"a".to_vec()),
            (11, b"b".to_vec()),
            (12, b"c".to_vec())
        ]
    );
    assert_eq!(only_spilled.end, 13);
    assert!(only_spilled.only_spilled);
}

#[tokio::test]
async fn test_sequenced_peeks_reorder() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&client).await;

    let subscriber = Uid::random();

    // Sequence 1 arrives first and must wait for sequence 0 to establish
    // its begin version.
    let early = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .peek_full(T, 1, false, false, Some((subscriber, 1)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!early.is_finished());

    let first = client
        .peek_full(T, 10, false, false, Some((subscriber, 0)))
        .await
        .unwrap();
    assert_eq!(first.end, 13);
    assert_eq!(decode(first.messages).len(), 3);

    // Unblock sequence 1 (its begin becomes 13) with one more commit.
    client
        .commit(12, 13, 12, one_message(&[T], b"d"), false)
        .await
        .unwrap();
    let second = early.await.unwrap().unwrap();
    assert_eq!(second.begin, 13);
    assert_eq!(decode(second.messages), vec![(13, b"d".to_vec())]);
    assert_eq!(second.end, 14);
}

#[tokio::test]
async fn test_idempotent_commit() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    let batch = one_message(&[T], b"once");
    let first = client.commit(0, 10, 9, batch.clone(), false).await.unwrap();
    let second = client.commit(0, 10, 9, batch, false).await.unwrap();
    assert_eq!(first, second);

    let reply = client.peek(T, 1).await.unwrap();
    assert_eq!(decode(reply.messages), vec![(10, b"once".to_vec())]);
}

#[tokio::test]
async fn test_empty_commit_advances_version() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    client.commit(0, 10, 9, Bytes::new(), false).await.unwrap();
    let reply = client.peek(T, 1).await.unwrap();
    assert!(reply.messages.is_empty());
    assert_eq!(reply.end, 11);
    assert_eq!(reply.max_known_version, 10);
}

#[tokio::test]
async fn test_peek_unknown_tag_is_empty() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&client).await;

    let reply = client.peek(Tag::new(0, 999), 1).await.unwrap();
    assert!(reply.messages.is_empty());
    assert_eq!(reply.end, 13);
}

#[tokio::test]
async fn test_peek_return_if_blocked() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&client).await;

    let blocked = client.peek_full(T, 50, true, false, None).await;
    assert!(matches!(blocked, Err(Error::EndOfStream)));
}

#[tokio::test]
async fn test_backpressure_unblocks_on_pop() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new(dir.path());
    config.knobs.hard_limit_bytes = 400;
    let server = TLogServer::start(config, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    // First commit fills the budget (payload + per-entry overhead).
    client
        .commit(0, 10, 9, one_message(&[T], &[0u8; 400]), false)
        .await
        .unwrap();
    let (input, durable) = server.byte_counters();
    assert!(input - durable >= 400);

    // Second commit must stall until a pop releases bytes.
    let stalled = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .commit(10, 11, 10, one_message(&[T], b"small"), false)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!stalled.is_finished(), "commit should be stalled at the byte limit");

    client.pop(T, 11).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), stalled)
        .await
        .expect("commit should unblock after the pop")
        .unwrap()
        .unwrap();
    assert!(reply.durable_known_committed_version <= 10);
}

#[tokio::test]
async fn test_lock_stops_commits() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&client).await;

    let locked = client.lock().await.unwrap();
    assert_eq!(locked.end, 12);
    assert_eq!(locked.known_committed_version, 11);

    let refused = client
        .commit(12, 13, 12, one_message(&[T], b"late"), false)
        .await;
    assert!(matches!(refused, Err(Error::TLogStopped)));

    // Peeks keep working on a locked generation.
    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(decode(reply.messages).len(), 3);
}

#[tokio::test]
async fn test_recruitment_hands_off_between_generations() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let old_client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&old_client).await;

    // Coordinator flow: lock the old generation, then recruit the new one
    // pointing back at it.
    let locked = old_client.lock().await.unwrap();
    let (addr, token) = server.recruit_endpoint();
    let old_interface = old_client.interface().clone();
    let new_interface = recruit(
        &transport,
        addr,
        token,
        |reply| RecruitRequest {
            reply,
            recruitment_id: Uid::random(),
            epoch: 2,
            locality: 0,
            log_router_tags: 0,
            known_committed_version: locked.known_committed_version,
            recover_at: locked.end,
            recover_tags: vec![T],
            recover_from: Some(RecoverFrom {
                logs: vec![old_interface],
            }),
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();
    let new_client = TLogClient::new(transport.clone(), new_interface);

    // The pulled window (known_committed, recover_at] is re-served by the
    // new generation.
    let reply = new_client.peek(T, 12).await.unwrap();
    assert_eq!(decode(reply.messages), vec![(12, b"c".to_vec())]);

    // Commits continue on the new generation from recover_at.
    new_client
        .commit(locked.end, 13, 12, one_message(&[T], b"d"), false)
        .await
        .unwrap();
    let reply = new_client.peek(T, 12).await.unwrap();
    assert_eq!(
        decode(reply.messages),
        vec![(12, b"c".to_vec()), (13, b"d".to_vec())]
    );

    // The old generation refuses new commits but still serves history.
    let refused = old_client
        .commit(12, 14, 13, one_message(&[T], b"x"), false)
        .await;
    assert!(matches!(refused, Err(Error::TLogStopped)));
    let old_reply = old_client.peek(T, 10).await.unwrap();
    assert_eq!(decode(old_reply.messages).len(), 3);
}

#[tokio::test]
async fn test_pops_release_disk_queue() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new(dir.path());
    config.queue_segment_bytes = Some(256);
    let server = TLogServer::start(config, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    let mut prev = 0;
    for version in 10u64..30 {
        client
            .commit(
                prev,
                version,
                version - 1,
                one_message(&[T], &[version as u8; 100]),
                false,
            )
            .await
            .unwrap();
        prev = version;
    }
    server.force_spill().await.unwrap();
    let used_before = server.queue_storage_bytes().await.used;
    assert!(used_before > 1024);

    // Pop past everything, then let reclamation run.
    client.pop(T, 30).await.unwrap();
    server.force_spill().await.unwrap();
    let used_after = server.queue_storage_bytes().await.used;
    assert!(
        used_after < used_before,
        "pop should reclaim queue segments ({} -> {})",
        used_before,
        used_after
    );

    let (input, durable) = server.byte_counters();
    assert!(durable <= input);
}

#[tokio::test]
async fn test_queuing_metrics_and_confirm_running() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;
    commit_abc(&client).await;

    client.confirm_running().await.unwrap();
    let metrics = client.queuing_metrics().await.unwrap();
    assert_eq!(metrics.v, 12);
    assert!(metrics.bytes_input >= metrics.bytes_durable);
    assert!(metrics.local_time > 0.0);
    assert!(metrics.storage_bytes.total > 0);
}

#[tokio::test]
async fn test_txs_tag_value_spill_roundtrip() {
    use taglog_core::TXS_TAG;
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    let mut prev = 0;
    for (version, payload) in [(10u64, b"t1" as &[u8]), (11, b"t2")] {
        client
            .commit(prev, version, version - 1, one_message(&[TXS_TAG], payload), false)
            .await
            .unwrap();
        prev = version;
    }
    server.force_spill().await.unwrap();

    // The txs tag is value-spilled; the read must not touch references.
    let reply = client.peek(TXS_TAG, 10).await.unwrap();
    assert_eq!(
        decode(reply.messages),
        vec![(10, b"t1".to_vec()), (11, b"t2".to_vec())]
    );
}

#[tokio::test]
async fn test_stale_recruit_epoch_is_refused() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let _client = recruit_fresh(&transport, &server, 5).await;

    let (addr, token) = server.recruit_endpoint();
    let stale = recruit(
        &transport,
        addr,
        token,
        |reply| RecruitRequest {
            reply,
            recruitment_id: Uid::random(),
            epoch: 5,
            locality: 0,
            log_router_tags: 0,
            known_committed_version: 0,
            recover_at: 0,
            recover_tags: Vec::new(),
            recover_from: None,
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(matches!(stale, Err(Error::RecruitmentFailed(_))));
}

/// A token for an endpoint nobody registered gets answered with
/// endpoint-not-found and must not break the server's connection.
#[tokio::test]
async fn test_bogus_endpoint_does_not_break_server() {
    let dir = TempDir::new().unwrap();
    let server = start_server(&dir).await;
    let transport = client_transport().await;
    let client = recruit_fresh(&transport, &server, 1).await;

    transport.send_unreliable(
        server.local_addr(),
        Token::new(1, 12345, 0, true),
        Bytes::from_static(b"to nobody"),
    );
    commit_abc(&client).await;
    let reply = client.peek(T, 10).await.unwrap();
    assert_eq!(decode(reply.messages).len(), 3);
}
