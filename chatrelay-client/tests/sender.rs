use std::time::Duration;

use chatrelay_client::{ChatSender, SendError};
use chatrelay_core::{ChatRecord, CoreError, MAX_UDP_PAYLOAD_BYTES, decode_record};
use tokio::{net::UdpSocket, time::timeout};

fn record(text: &str) -> ChatRecord {
    ChatRecord {
        sender: "alice".to_owned(),
        chatroom: "lobby".to_owned(),
        text: text.to_owned(),
        timestamp_ms: 1_735_000_000_000,
        latitude: Some(40.7),
        longitude: Some(-74.0),
    }
}

#[tokio::test]
async fn record_arrives_as_one_datagram() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
    let address = receiver.local_addr().expect("receiver addr");

    let sender = ChatSender::connect(address).await.expect("connect sender");
    assert_eq!(sender.server(), address);
    let sent = sender.send(&record("hello relay")).await.expect("send record");

    let mut buf = vec![0_u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
        .await
        .expect("datagram arrives")
        .expect("recv datagram");
    assert_eq!(len, sent);
    assert_eq!(decode_record(&buf[..len], 0).unwrap(), record("hello relay"));
}

#[tokio::test]
async fn hostname_targets_are_resolved() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
    let port = receiver.local_addr().expect("receiver addr").port();

    let sender = ChatSender::connect(format!("localhost:{port}"))
        .await
        .expect("resolve localhost");
    assert_eq!(sender.server().port(), port);
}

#[tokio::test]
async fn oversized_record_is_not_sent() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
    let sender = ChatSender::connect(receiver.local_addr().unwrap())
        .await
        .expect("connect sender");

    let err = sender
        .send(&record(&"x".repeat(MAX_UDP_PAYLOAD_BYTES)))
        .await
        .expect_err("oversized record must fail");
    assert!(matches!(
        err,
        SendError::Encode(CoreError::RecordTooLarge { .. })
    ));
}
