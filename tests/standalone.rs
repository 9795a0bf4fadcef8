mod helpers;

use helpers::{bulk, ok, MockServer, Reply};
use pretty_assertions::assert_eq;
use shoal::config::{NodeAddress, ProtocolVersion, ReconnectStrategy};
use shoal::connection::{Connection, HandshakeConfig};
use shoal::frame::ValkeyFrame;
use shoal::transaction::Transaction;
use shoal::{cmd, Client, ClientConfig, Error};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn standalone_config(address: &str) -> ClientConfig {
    let (host, port) = address.rsplit_once(':').unwrap();
    ClientConfig {
        addresses: vec![NodeAddress::new(host, port.parse().unwrap())],
        ..Default::default()
    }
}

#[tokio::test]
async fn get_set_del_roundtrip() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        b"SET" => Reply::Frame(ok()),
        b"GET" => Reply::Frame(bulk("bar")),
        b"DEL" => Reply::Frame(ValkeyFrame::Integer(1)),
        _ => Reply::Frame(ValkeyFrame::Error("ERR unexpected".into())),
    })
    .await;

    let client = Client::connect(standalone_config(&server.address))
        .await
        .unwrap();

    let reply = client
        .submit(cmd("SET").arg("foo").arg("bar"), None)
        .await
        .unwrap();
    assert_eq!(reply, ok());

    let reply = client.submit(cmd("GET").arg("foo"), None).await.unwrap();
    assert_eq!(reply, bulk("bar"));

    let reply = client.submit(cmd("DEL").arg("foo"), None).await.unwrap();
    assert_eq!(reply, ValkeyFrame::Integer(1));

    client.close().await;
}

#[tokio::test]
async fn server_errors_pass_through() {
    let server = MockServer::spawn(|_| {
        Reply::Frame(ValkeyFrame::Error(
            "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
        ))
    })
    .await;

    let client = Client::connect(standalone_config(&server.address))
        .await
        .unwrap();

    let error = client.submit(cmd("GET").arg("foo"), None).await.unwrap_err();
    match error {
        Error::Request(message) => assert!(message.starts_with("WRONGTYPE")),
        other => panic!("expected Request error, got {other:?}"),
    }
}

#[tokio::test]
async fn pipelined_responses_preserve_submission_order() {
    let counter = AtomicI64::new(0);
    let server = MockServer::spawn(move |args| match args[0].as_slice() {
        b"INCR" => Reply::Frame(ValkeyFrame::Integer(
            counter.fetch_add(1, Ordering::SeqCst) + 1,
        )),
        _ => Reply::Frame(ok()),
    })
    .await;

    let handshake = HandshakeConfig {
        protocol: ProtocolVersion::Resp2,
        credentials: None,
        client_name: None,
        database_id: None,
    };
    let connection = Connection::connect(
        &server.address,
        &handshake,
        &None,
        Duration::from_secs(3),
    )
    .await
    .unwrap();

    // Queue 50 requests without awaiting any; replies must come back in
    // submission order.
    let receivers: Vec<_> = (0..50)
        .map(|_| connection.send(cmd("INCR").arg("k").to_frame()).unwrap())
        .collect();

    for (i, rx) in receivers.into_iter().enumerate() {
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply, ValkeyFrame::Integer(i as i64 + 1));
    }
}

#[tokio::test]
async fn timeout_rejects_but_late_reply_keeps_the_stream_aligned() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        // Wedged long enough for the deadline to fire first.
        b"GET" => Reply::Delayed(Duration::from_millis(150), bulk("late")),
        b"PING" => Reply::Frame(ValkeyFrame::SimpleString("PONG".into())),
        _ => Reply::Frame(ok()),
    })
    .await;

    let mut config = standalone_config(&server.address);
    config.request_timeout_ms = 100;
    let client = Client::connect(config).await.unwrap();

    let started = Instant::now();
    let error = client.submit(cmd("GET").arg("foo"), None).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(error, Error::Timeout));
    assert!(elapsed >= Duration::from_millis(95), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "fired late: {elapsed:?}");

    // The late GET reply is discarded against its own callback slot, so the
    // next request still gets the right answer.
    let reply = client.submit(cmd("PING"), None).await.unwrap();
    assert_eq!(reply, ValkeyFrame::SimpleString("PONG".into()));
}

#[tokio::test]
async fn close_rejects_pending_once_and_further_submissions_synchronously() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        b"GET" => Reply::Silent,
        _ => Reply::Frame(ok()),
    })
    .await;

    let mut config = standalone_config(&server.address);
    config.request_timeout_ms = 5_000;
    let client = Client::connect(config).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.submit(cmd("GET").arg("foo"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Closing)), "got {result:?}");

    let started = Instant::now();
    let result = client.submit(cmd("PING"), None).await;
    assert!(matches!(result, Err(Error::Closing)));
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test]
async fn reconnect_backoff_is_bounded_and_scheduled() {
    // Grab a port that nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = standalone_config(&address);
    config.connect_timeout_ms = 200;
    config.reconnect_strategy = ReconnectStrategy {
        number_of_retries: 2,
        factor: 2,
        exponent_base: 2,
        base_ms: 20,
        max_ms: 1_000,
    };

    let started = Instant::now();
    let error = Client::connect(config).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(error, Error::Connection(_)), "got {error:?}");
    // Two backoff sleeps: 20*2*2^0 = 40ms and 20*2*2^1 = 80ms.
    assert!(elapsed >= Duration::from_millis(120), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "gave up late: {elapsed:?}");
}

#[tokio::test]
async fn handshake_runs_setname_and_select_in_order() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        b"CLIENT" | b"SELECT" => Reply::Frame(ok()),
        b"GET" => Reply::Frame(bulk("bar")),
        _ => Reply::Frame(ok()),
    })
    .await;

    let mut config = standalone_config(&server.address);
    config.client_name = Some("tester".into());
    config.database_id = Some(2);
    let client = Client::connect(config).await.unwrap();

    let reply = client.submit(cmd("GET").arg("foo"), None).await.unwrap();
    assert_eq!(reply, bulk("bar"));

    let commands = server.commands();
    let names: Vec<&str> = commands.iter().map(|c| c[0].as_str()).collect();
    assert_eq!(names, vec!["HELLO", "CLIENT", "SELECT", "GET"]);
    assert_eq!(commands[1], vec!["CLIENT", "SETNAME", "tester"]);
    assert_eq!(commands[2], vec!["SELECT", "2"]);
}

#[tokio::test]
async fn transaction_returns_the_exec_array() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        b"MULTI" => Reply::Frame(ok()),
        b"SET" | b"INCR" => Reply::Frame(ValkeyFrame::SimpleString("QUEUED".into())),
        b"EXEC" => Reply::Frame(ValkeyFrame::Array(vec![ok(), ValkeyFrame::Integer(2)])),
        _ => Reply::Frame(ok()),
    })
    .await;

    let client = Client::connect(standalone_config(&server.address))
        .await
        .unwrap();

    let replies = Transaction::new()
        .command(cmd("SET").arg("k").arg(1i64))
        .command(cmd("INCR").arg("k"))
        .exec(&client)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(replies, vec![ok(), ValkeyFrame::Integer(2)]);

    // The batch arrived as one ordered pipeline.
    let names: Vec<String> = server
        .commands()
        .iter()
        .map(|c| c[0].clone())
        .filter(|n| n != "HELLO")
        .collect();
    assert_eq!(names, vec!["MULTI", "SET", "INCR", "EXEC"]);
}

#[tokio::test]
async fn transaction_watch_conflict_resolves_to_none() {
    let server = MockServer::spawn(|args| match args[0].as_slice() {
        b"MULTI" => Reply::Frame(ok()),
        b"EXEC" => Reply::Frame(ValkeyFrame::Null),
        _ => Reply::Frame(ValkeyFrame::SimpleString("QUEUED".into())),
    })
    .await;

    let client = Client::connect(standalone_config(&server.address))
        .await
        .unwrap();

    let result = client
        .submit_transaction(vec![cmd("INCR").arg("k")], None)
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn transaction_abort_surfaces_the_queue_error() {
    let bad_command = AtomicUsize::new(0);
    let server = MockServer::spawn(move |args| match args[0].as_slice() {
        b"MULTI" => Reply::Frame(ok()),
        b"INCR" => {
            bad_command.fetch_add(1, Ordering::SeqCst);
            Reply::Frame(ValkeyFrame::Error(
                "ERR wrong number of arguments for 'incr' command".into(),
            ))
        }
        b"EXEC" => Reply::Frame(ValkeyFrame::Error(
            "EXECABORT Transaction discarded because of previous errors.".into(),
        )),
        _ => Reply::Frame(ValkeyFrame::SimpleString("QUEUED".into())),
    })
    .await;

    let client = Client::connect(standalone_config(&server.address))
        .await
        .unwrap();

    let error = client
        .submit_transaction(vec![cmd("INCR")], None)
        .await
        .unwrap_err();
    match error {
        Error::ExecAbort(message) => assert!(message.contains("wrong number of arguments")),
        other => panic!("expected ExecAbort, got {other:?}"),
    }
}
