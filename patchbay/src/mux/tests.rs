use super::*;

use serde_json::json;
use tokio::io::duplex;

#[tokio::test]
async fn sessions_are_isolated_and_fifo() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let mut server = Multiplexer::server_on(b);

    let mut s1 = client.open().unwrap();
    let mut s2 = client.open().unwrap();
    assert_ne!(s1.id(), s2.id());

    // interleave writes across the two sessions
    for i in 0..5 {
        s1.write(json!({"from": "s1", "seq": i})).await.unwrap();
        s2.write(json!({"from": "s2", "seq": i})).await.unwrap();
    }

    let mut p1 = server.accept().await.unwrap();
    let mut p2 = server.accept().await.unwrap();
    assert_eq!(p1.id(), s1.id());
    assert_eq!(p2.id(), s2.id());

    for i in 0..5 {
        assert_eq!(p1.read().await, Some(json!({"from": "s1", "seq": i})));
    }
    for i in 0..5 {
        assert_eq!(p2.read().await, Some(json!({"from": "s2", "seq": i})));
    }
}

#[tokio::test]
async fn responses_cross_sessions_out_of_order() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let mut server = Multiplexer::server_on(b);

    let mut s1 = client.open().unwrap();
    let mut s2 = client.open().unwrap();
    s1.write(json!({"req": 1})).await.unwrap();
    s2.write(json!({"req": 2})).await.unwrap();

    let mut p1 = server.accept().await.unwrap();
    let mut p2 = server.accept().await.unwrap();
    p1.read().await.unwrap();
    p2.read().await.unwrap();

    // the second session answers first
    p2.write(json!({"resp": 2})).await.unwrap();
    p1.write(json!({"resp": 1})).await.unwrap();

    assert_eq!(s2.read().await, Some(json!({"resp": 2})));
    assert_eq!(s1.read().await, Some(json!({"resp": 1})));
}

#[tokio::test]
async fn envelope_noise_is_ignored() {
    let (a, b) = duplex(64 * 1024);
    let (_ra, wa) = tokio::io::split(a);
    let mut raw = FramedWrite::new(Box::new(wa) as BoxWrite);
    let mut server = Multiplexer::server_on(b);

    // none of these are well-formed envelopes
    raw.write(&json!({})).await.unwrap();
    raw.write(&json!({"content": {"x": 1}})).await.unwrap();
    raw.write(&json!({"session": -1, "content": {}})).await.unwrap();
    raw.write(&json!({"session": 1.5, "content": {}})).await.unwrap();
    raw.write(&json!({"session": "7", "content": {}})).await.unwrap();
    raw.write(&json!({"session": 7, "content": {}, "extra": true}))
        .await
        .unwrap();
    // this one is
    raw.write(&json!({"session": 7, "content": {"ok": true}}))
        .await
        .unwrap();

    let mut p = server.accept().await.unwrap();
    assert_eq!(p.id(), 7);
    assert_eq!(p.read().await, Some(json!({"ok": true})));
}

#[tokio::test]
async fn peer_close_ends_reads() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let mut server = Multiplexer::server_on(b);

    let mut s = client.open().unwrap();
    s.write(json!({"hello": 1})).await.unwrap();

    let mut p = server.accept().await.unwrap();
    assert_eq!(p.read().await, Some(json!({"hello": 1})));

    s.close().await;
    assert_eq!(p.read().await, None);
}

#[tokio::test]
async fn local_close_wakes_pending_read() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let _server = Multiplexer::server_on(b);

    let mut s = client.open().unwrap();
    s.write(json!({"x": 1})).await.unwrap();
    s.close().await;
    assert_eq!(s.read().await, None);
    assert!(matches!(s.write(json!({})).await, Err(MuxError::SessionClosed)));
}

#[tokio::test]
async fn base_eos_ends_every_session() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let mut server = Multiplexer::server_on(b);

    let mut s1 = client.open().unwrap();
    let mut s2 = client.open().unwrap();
    s1.write(json!({"a": 1})).await.unwrap();
    s2.write(json!({"b": 2})).await.unwrap();

    let mut p1 = server.accept().await.unwrap();
    let mut p2 = server.accept().await.unwrap();
    p1.read().await.unwrap();
    p2.read().await.unwrap();

    client.shutdown().await;
    assert_eq!(p1.read().await, None);
    assert_eq!(p2.read().await, None);
    assert!(server.accept().await.is_none());
}

#[tokio::test]
async fn client_mode_ignores_peer_opened_sessions() {
    let (a, b) = duplex(64 * 1024);
    let mut client = Multiplexer::client_on(a);
    let server = Multiplexer::server_on(b);

    // a client-mode manager has no accept queue
    assert!(client.accept().await.is_none());

    // the server writes on a session the client never opened
    let mut s = server.open().unwrap();
    s.write(json!({"who": "server"})).await.unwrap();

    // the client still works for its own sessions
    let mut c = client.open().unwrap();
    c.write(json!({"ping": 1})).await.unwrap();
}

#[tokio::test]
async fn client_closes_base_after_last_session() {
    let (a, b) = duplex(64 * 1024);
    let client = Multiplexer::client_on(a);
    let mut server = Multiplexer::server_on(b);

    let mut s = client.open().unwrap();
    s.write(json!({"only": true})).await.unwrap();
    let mut p = server.accept().await.unwrap();
    assert_eq!(p.read().await, Some(json!({"only": true})));

    s.close().await;

    // peer sees the session close and then the base close
    assert_eq!(p.read().await, None);
    assert!(server.accept().await.is_none());
    assert!(matches!(
        client.open(),
        Err(MuxError::BaseClosed)
    ));
}
