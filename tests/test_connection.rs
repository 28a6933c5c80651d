mod support;

use rudis::{Connection, ConnectionEvent, ErrorKind, ProtocolVersion, Value};
use std::time::Duration;
use support::*;
use tokio::sync::mpsc;

#[tokio::test]
async fn simple_set_and_get() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) = connect_resp3(&server, config).await;

    let set = tokio::spawn({
        let connection = connection.clone();
        async move { connection.set("foo", "bar").await }
    });
    session.expect(&["SET", "foo", "bar"]).await;
    session.send(b"+OK\r\n").await;
    assert_eq!(set.await.unwrap().unwrap(), Value::Okay);

    let get = tokio::spawn({
        let connection = connection.clone();
        async move { connection.get("foo").await }
    });
    session.expect(&["GET", "foo"]).await;
    session.send(b"$3\r\nbar\r\n").await;
    assert_eq!(
        get.await.unwrap().unwrap(),
        Value::BulkString(b"bar".to_vec())
    );
}

#[tokio::test]
async fn pipelined_replies_resolve_in_issue_order() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) = connect_resp3(&server, config).await;

    let client = tokio::spawn({
        let connection = connection.clone();
        async move {
            tokio::join!(
                connection.incr("x"),
                connection.incr("x"),
                connection.incr("x"),
            )
        }
    });
    session.expect(&["INCR", "x"]).await;
    session.expect(&["INCR", "x"]).await;
    session.expect(&["INCR", "x"]).await;
    // All three replies in a single chunk.
    session.send(b":1\r\n:2\r\n:3\r\n").await;

    let (first, second, third) = client.await.unwrap();
    assert_eq!(first.unwrap(), Value::Int(1));
    assert_eq!(second.unwrap(), Value::Int(2));
    assert_eq!(third.unwrap(), Value::Int(3));
}

#[tokio::test]
async fn pipeline_depth_bounds_in_flight_requests() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) =
        connect_resp3(&server, config.with_pipeline_depth(2)).await;

    let client = tokio::spawn({
        let connection = connection.clone();
        async move {
            tokio::join!(
                connection.incr("a"),
                connection.incr("b"),
                connection.incr("c"),
            )
        }
    });
    session.expect(&["INCR", "a"]).await;
    session.expect(&["INCR", "b"]).await;
    // The third command must not hit the wire until a reply frees a
    // pipeline slot.
    session.assert_no_traffic(Duration::from_millis(100)).await;
    session.send(b":1\r\n").await;
    session.expect(&["INCR", "c"]).await;
    session.send(b":2\r\n:3\r\n").await;

    let (first, second, third) = client.await.unwrap();
    assert_eq!(first.unwrap(), Value::Int(1));
    assert_eq!(second.unwrap(), Value::Int(2));
    assert_eq!(third.unwrap(), Value::Int(3));
}

#[tokio::test]
async fn replies_pair_fifo_across_many_commands() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) = connect_resp3(&server, config).await;

    let client = tokio::spawn({
        let connection = connection.clone();
        async move {
            let calls: Vec<_> = (0..10).map(|i| connection.echo(i.to_string())).collect();
            futures::future::join_all(calls).await
        }
    });
    for i in 0..10 {
        session.expect(&["ECHO", &i.to_string()]).await;
    }
    let replies: String = (0..10).map(|i| format!("$1\r\n{i}\r\n")).collect();
    session.send(replies.as_bytes()).await;

    for (i, result) in client.await.unwrap().into_iter().enumerate() {
        assert_eq!(
            result.unwrap(),
            Value::BulkString(i.to_string().into_bytes())
        );
    }
}

#[tokio::test]
async fn resp2_fallback_runs_auth_setname_and_select() {
    let (server, config) = MockServer::bind().await;
    let config = config
        .with_auth("s3cret")
        .with_client_name("worker-1")
        .with_database(2);

    let task = tokio::spawn(Connection::connect(config));
    let mut session = server.accept().await;
    session
        .expect(&[
            "HELLO", "3", "AUTH", "default", "s3cret", "SETNAME", "worker-1",
        ])
        .await;
    session.send(b"-ERR unknown command 'HELLO'\r\n").await;
    session.expect(&["AUTH", "s3cret"]).await;
    session.send(b"+OK\r\n").await;
    session.expect(&["CLIENT", "SETNAME", "worker-1"]).await;
    session.send(b"+OK\r\n").await;
    session.expect(&["SELECT", "2"]).await;
    session.send(b"+OK\r\n").await;

    let connection = task.await.unwrap().unwrap();
    assert_eq!(connection.protocol(), ProtocolVersion::Resp2);
}

#[tokio::test]
async fn resp3_handshake_fixes_the_protocol_level() {
    let (server, config) = MockServer::bind().await;
    let (connection, _session) = connect_resp3(&server, config).await;
    assert_eq!(connection.protocol(), ProtocolVersion::Resp3);
}

#[tokio::test]
async fn connect_propagates_auth_failure() {
    let (server, config) = MockServer::bind().await;
    let task = tokio::spawn(Connection::connect(config.with_auth("wrong")));
    let mut session = server.accept().await;
    let _hello = session.read_command().await;
    session
        .send(b"-WRONGPASS invalid username-password pair\r\n")
        .await;

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Redis);
    assert!(err.to_string().contains("WRONGPASS"));
}

#[tokio::test]
async fn server_errors_fail_only_their_command() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) = connect_resp3(&server, config).await;

    let client = tokio::spawn({
        let connection = connection.clone();
        async move { tokio::join!(connection.incr("k"), connection.ttl("k")) }
    });
    session.expect(&["INCR", "k"]).await;
    session.expect(&["TTL", "k"]).await;
    session
        .send(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
        .await;
    session.send(b":-1\r\n").await;

    let (incr, ttl) = client.await.unwrap();
    let err = incr.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Redis);
    assert!(!err.is_disconnected());
    assert_eq!(ttl.unwrap(), Value::Int(-1));
}

#[tokio::test]
async fn disconnect_fails_pending_commands_and_closes_sinks() {
    let (server, config) = MockServer::bind().await;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (connection, mut session) =
        connect_resp3(&server, config.on_disconnect(events_tx)).await;
    assert!(matches!(
        events_rx.recv().await,
        Some(ConnectionEvent::Connected { .. })
    ));

    let subscribe = tokio::spawn({
        let connection = connection.clone();
        async move { connection.subscribe(["news"]).await }
    });
    session.expect(&["SUBSCRIBE", "news"]).await;
    session
        .send(b">3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
        .await;
    let mut streams = subscribe.await.unwrap().unwrap();

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.ping().await }
    });
    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.ping().await }
    });
    session.expect(&["PING"]).await;
    session.expect(&["PING"]).await;
    drop(session);

    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Redis);
    assert!(err.is_disconnected());
    let err = second.await.unwrap().unwrap_err();
    assert!(err.is_disconnected());

    // Subscription sinks close, the event sink fires, later commands
    // fail immediately.
    assert!(streams[0].recv().await.is_none());
    assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Disconnected));
    assert!(connection.ping().await.unwrap_err().is_disconnected());
}

#[tokio::test]
async fn cancelled_commands_are_dropped_before_the_write() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) =
        connect_resp3(&server, config.with_pipeline_depth(1)).await;

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.incr("a").await }
    });
    session.expect(&["INCR", "a"]).await;

    // The second command parks behind the pipeline bound, then its
    // caller goes away before any bytes were written.
    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.incr("b").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    second.abort();
    let _ = second.await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.send(b":1\r\n").await;
    let third = tokio::spawn({
        let connection = connection.clone();
        async move { connection.incr("c").await }
    });
    // The cancelled command is skipped; the next thing on the wire is
    // the third command.
    session.expect(&["INCR", "c"]).await;
    session.send(b":2\r\n").await;

    assert_eq!(first.await.unwrap().unwrap(), Value::Int(1));
    assert_eq!(third.await.unwrap().unwrap(), Value::Int(2));
}

#[tokio::test]
async fn keys_defaults_the_pattern() {
    let (server, config) = MockServer::bind().await;
    let (connection, mut session) = connect_resp3(&server, config).await;

    let keys = tokio::spawn({
        let connection = connection.clone();
        async move { connection.keys(None::<&str>).await }
    });
    session.expect(&["KEYS", "*"]).await;
    session.send(b"*1\r\n$3\r\nfoo\r\n").await;
    assert_eq!(
        keys.await.unwrap().unwrap(),
        Value::Array(vec![Value::BulkString(b"foo".to_vec())])
    );

    let keys = tokio::spawn({
        let connection = connection.clone();
        async move { connection.keys(Some("user:*")).await }
    });
    session.expect(&["KEYS", "user:*"]).await;
    session.send(b"*0\r\n").await;
    assert_eq!(keys.await.unwrap().unwrap(), Value::Array(vec![]));
}
