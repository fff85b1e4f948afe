use std::{net::SocketAddr, time::Duration};

use chatrelay_core::{ChatRecord, Message, Peer, encode_record};
use chatrelay_server::{
    ChangeFeed, ChatDatabase, IngestHandle, IngestLoop, IngestState, Snapshot,
};
use tokio::{net::UdpSocket, time::timeout};

const ALICE_HI: &[u8] =
    br#"{"name":"alice","room":"lobby","text":"hi","timestamp":1000,"latitude":40.7,"longitude":-74.0}"#;

struct TestRelay {
    database: ChatDatabase,
    handle: IngestHandle,
    sender: UdpSocket,
}

impl TestRelay {
    fn address(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    async fn send_raw(&self, payload: &[u8]) {
        self.sender
            .send_to(payload, self.address())
            .await
            .expect("send datagram");
    }

    async fn send_record(&self, record: &ChatRecord) {
        let payload = encode_record(record).expect("encode record");
        self.send_raw(&payload).await;
    }
}

#[tokio::test]
async fn single_datagram_creates_peer_and_message() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();
    assert_eq!(messages.next().await.as_deref(), Some(&Vec::new()));

    relay.send_raw(ALICE_HI).await;

    let stored = wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;
    assert_eq!(stored[0].sender, "alice");
    assert_eq!(stored[0].chatroom, "lobby");
    assert_eq!(stored[0].text, "hi");

    let peers = relay.database.peers().fetch_all().snapshot();
    assert_eq!(
        *peers,
        vec![Peer {
            name: "alice".to_owned(),
            timestamp_ms: 1000,
            latitude: Some(40.7),
            longitude: Some(-74.0),
        }]
    );
    assert!(relay.handle.is_healthy());

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn repeat_sender_is_upserted_and_messages_are_appended() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();

    relay.send_record(&record("alice", "first", 1000)).await;
    wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;
    relay.send_record(&record("alice", "second", 2000)).await;
    let stored = wait_for_len(&mut messages, 2, Duration::from_secs(2)).await;

    assert_eq!(
        stored.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
        ["first", "second"]
    );
    assert!(stored.iter().all(|m| m.sender == "alice"));

    let peers = relay.database.peers().fetch_all().snapshot();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].timestamp_ms, 2000);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn zero_length_datagram_is_skipped() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();

    relay.send_raw(&[]).await;
    relay.send_record(&record("bob", "after empty", 5)).await;

    let stored = wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;
    assert_eq!(stored[0].text, "after empty");
    assert_eq!(relay.database.peers().len(), 1);
    assert_eq!(relay.handle.state(), IngestState::Waiting);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_and_nameless_datagrams_do_not_mutate_stores() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();

    relay.send_raw(b"definitely not a record").await;
    relay.send_raw(&[0xFF, 0x00, 0xAB, 0xCD]).await;
    relay
        .send_raw(br#"{"room":"lobby","text":"who am i","timestamp":1}"#)
        .await;
    relay.send_record(&record("carol", "valid", 10)).await;

    let stored = wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender, "carol");

    let peers = relay.database.peers().fetch_all().snapshot();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "carol");
    assert!(relay.handle.is_healthy(), "decode failures must not fault");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn sender_feed_follows_only_that_sender() {
    let relay = start_relay().await;
    let mut alice = relay.database.messages().fetch_by_sender("alice");
    let mut everything = relay.database.messages().fetch_all();
    assert_eq!(alice.next().await.as_deref(), Some(&Vec::new()));

    relay.send_record(&record("alice", "a1", 1)).await;
    relay.send_record(&record("bob", "b1", 2)).await;
    relay.send_record(&record("alice", "a2", 3)).await;

    wait_for_len(&mut everything, 3, Duration::from_secs(2)).await;
    let from_alice = wait_for_len(&mut alice, 2, Duration::from_secs(2)).await;
    assert_eq!(
        from_alice.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
        ["a1", "a2"]
    );

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_gets_current_contents_immediately() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();
    relay.send_record(&record("dave", "hello", 1)).await;
    wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;

    let mut late = relay.database.peers().fetch_all();
    let first = timeout(Duration::from_millis(100), late.next())
        .await
        .expect("initial snapshot is immediate")
        .expect("store alive");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "dave");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_keeps_persisted_data_queryable() {
    let relay = start_relay().await;
    let mut messages = relay.database.messages().fetch_all();
    relay.send_record(&record("erin", "before stop", 1)).await;
    wait_for_len(&mut messages, 1, Duration::from_secs(2)).await;

    let address = relay.address();
    assert_eq!(relay.handle.shutdown().await, IngestState::Stopped);

    relay
        .sender
        .send_to(&encode_record(&record("erin", "after stop", 2)).unwrap(), address)
        .await
        .ok();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(relay.database.messages().len(), 1);
    assert!(relay.database.peers().fetch_by_name("erin").unwrap().is_some());
}

fn record(sender: &str, text: &str, timestamp_ms: i64) -> ChatRecord {
    ChatRecord {
        sender: sender.to_owned(),
        chatroom: "lobby".to_owned(),
        text: text.to_owned(),
        timestamp_ms,
        latitude: None,
        longitude: None,
    }
}

async fn start_relay() -> TestRelay {
    let database = ChatDatabase::open_in_memory().expect("open in-memory database");
    let handle = IngestLoop::bind("127.0.0.1:0", &database)
        .await
        .expect("bind ephemeral ingest socket")
        .spawn()
        .expect("spawn ingest loop");
    let sender = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind sender socket");
    TestRelay {
        database,
        handle,
        sender,
    }
}

async fn wait_for_len(
    feed: &mut ChangeFeed<Message>,
    len: usize,
    wait: Duration,
) -> Snapshot<Message> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_default();
        let snapshot = timeout(remaining, feed.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {len} messages"))
            .expect("message store alive");
        if snapshot.len() >= len {
            return snapshot;
        }
    }
}
