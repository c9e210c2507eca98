mod common;

use std::time::Duration;

use common::{connect, connect_with_buffer, init_logger, str_value, variant};
use systemd_control::wire::{self, Message, Reply};
use systemd_control::{Builder, Connection, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

const SYSTEMD: &str = "org.freedesktop.systemd1";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
const UNIT_A: &str = "/org/freedesktop/systemd1/unit/a_2eservice";
const UNIT_B: &str = "/org/freedesktop/systemd1/unit/b_2eservice";

async fn get_id(connection: &Connection, path: &str) -> Result<Reply> {
    connection
        .call(
            SYSTEMD,
            path,
            PROPERTIES,
            "Get",
            &[str_value("org.freedesktop.systemd1.Unit"), str_value("Id")],
        )
        .await
}

fn echo_path(call: &Message) -> Reply {
    let path = call.path.as_ref().unwrap().as_str();
    Reply::Return(vec![variant(str_value(path))])
}

#[tokio::test]
async fn test_replies_in_reverse_order() {
    let (connection, mut bus) = connect(Duration::from_secs(10));
    let (a, b, ()) = tokio::join!(
        get_id(&connection, UNIT_A),
        get_id(&connection, UNIT_B),
        async {
            let first = bus.next_call().await;
            let second = bus.next_call().await;
            assert_ne!(first.serial, second.serial);
            for call in [&second, &first] {
                let path = call.path.as_ref().unwrap().as_str();
                bus.reply(call, &[variant(str_value(path))]).await;
            }
        }
    );
    assert_eq!(a.unwrap(), Reply::Return(vec![variant(str_value(UNIT_A))]));
    assert_eq!(b.unwrap(), Reply::Return(vec![variant(str_value(UNIT_B))]));
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_tasks_share_one_connection() {
    const CALLS: usize = 32;
    let (connection, mut bus) = connect(Duration::from_secs(10));

    let tasks: Vec<_> = (0..CALLS)
        .map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move {
                let path = format!("/org/freedesktop/systemd1/unit/u{}", i);
                let reply = get_id(&connection, &path).await.unwrap();
                assert_eq!(reply, Reply::Return(vec![variant(str_value(&path))]));
            })
        })
        .collect();

    let mut calls = Vec::new();
    for _ in 0..CALLS {
        calls.push(bus.next_call().await);
    }
    assert_eq!(connection.pending_calls(), CALLS);
    for call in calls.iter().rev() {
        if let Reply::Return(body) = echo_path(call) {
            bus.reply(call, &body).await;
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_releases_the_slot() {
    let (connection, mut bus) = connect(Duration::from_secs(2));
    let (result, call) = tokio::join!(get_id(&connection, UNIT_A), async {
        let call = bus.next_call().await;
        assert_eq!(connection.pending_calls(), 1);
        call
    });
    match result {
        Err(Error::Timeout { serial, after }) => {
            assert_eq!(serial, call.serial);
            assert_eq!(after, Duration::from_secs(2));
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(connection.pending_calls(), 0);

    // The late reply is dropped and the connection keeps working.
    bus.reply(&call, &[variant(str_value("late"))]).await;
    let (result, ()) = tokio::join!(get_id(&connection, UNIT_B), async {
        let call = bus.next_call().await;
        bus.reply(&call, &[variant(str_value("fresh"))]).await;
    });
    assert_eq!(
        result.unwrap(),
        Reply::Return(vec![variant(str_value("fresh"))])
    );
}

async fn get_large(connection: &Connection, argument: &str) -> Result<Reply> {
    connection
        .call(
            SYSTEMD,
            UNIT_A,
            PROPERTIES,
            "Get",
            &[str_value(argument), str_value("Id")],
        )
        .await
}

#[tokio::test]
async fn test_abandoned_call_is_written_whole() {
    // The message is much larger than the socket buffer, so the first call
    // is still being written when it is dropped.
    let (connection, mut bus) = connect_with_buffer(Duration::from_secs(10), 256);
    let large = "x".repeat(4096);
    let first = tokio::time::timeout(Duration::from_millis(50), get_large(&connection, &large));
    assert!(first.await.is_err(), "the first call should be cancelled");
    assert_eq!(connection.pending_calls(), 0);

    let (result, ()) = tokio::join!(get_id(&connection, UNIT_B), async {
        let abandoned = bus.next_call().await;
        assert_eq!(abandoned.body().unwrap()[0], str_value(&large));
        let call = bus.next_call().await;
        assert_eq!(call.path.as_ref().unwrap().as_str(), UNIT_B);
        bus.reply(&call, &[variant(str_value("b.service"))]).await;
    });
    assert_eq!(
        result.unwrap(),
        Reply::Return(vec![variant(str_value("b.service"))])
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_covers_a_stalled_write() {
    let (connection, _bus) = connect_with_buffer(Duration::from_millis(100), 256);
    let large = "x".repeat(4096);
    match get_large(&connection, &large).await {
        Err(Error::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_error_reply_is_not_a_transport_error() {
    let (connection, mut bus) = connect(Duration::from_secs(10));
    let (result, ()) = tokio::join!(get_id(&connection, UNIT_A), async {
        let call = bus.next_call().await;
        bus.reply_error(
            &call,
            "org.freedesktop.DBus.Error.UnknownProperty",
            "Unknown property",
        )
        .await;
    });
    assert_eq!(
        result.unwrap(),
        Reply::Error {
            name: "org.freedesktop.DBus.Error.UnknownProperty".to_owned(),
            message: "Unknown property".to_owned(),
        }
    );
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let (connection, mut bus) = connect(Duration::from_secs(60));
    let (result, ()) = tokio::join!(get_id(&connection, UNIT_A), async {
        bus.next_call().await;
        drop(bus);
    });
    assert!(matches!(result, Err(Error::Disconnected)), "{:?}", result);
    assert!(matches!(
        get_id(&connection, UNIT_B).await,
        Err(Error::Disconnected)
    ));
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_malformed_frame_fails_pending_calls() {
    let (connection, mut bus) = connect(Duration::from_secs(60));
    let (result, ()) = tokio::join!(get_id(&connection, UNIT_A), async {
        let call = bus.next_call().await;
        let mut reply = Message::method_return(&call, &[]).unwrap();
        reply.serial = 1;
        let mut bytes = reply.encode().unwrap();
        // protocol version
        bytes[3] = 2;
        bus.send_raw(&bytes).await;
    });
    assert!(
        matches!(
            result,
            Err(Error::Decode(wire::DecodeError::UnsupportedVersion(2)))
        ),
        "{:?}",
        result
    );
}

#[tokio::test]
async fn test_invalid_names_are_rejected_locally() {
    let (connection, _bus) = connect(Duration::from_secs(10));
    assert!(matches!(
        connection.call("not a bus name", UNIT_A, PROPERTIES, "Get", &[]).await,
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        connection.call(SYSTEMD, UNIT_A, PROPERTIES, "Get-It", &[]).await,
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        connection.call(SYSTEMD, "relative/path", PROPERTIES, "Get", &[]).await,
        Err(Error::DBusInvalidPath(_))
    ));
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_handshake() {
    init_logger();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (connection, ()) = tokio::join!(Builder::system().handshake(client), async move {
        let mut server = BufReader::new(server);
        assert_eq!(server.read_u8().await.unwrap(), 0);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("AUTH EXTERNAL "), "{:?}", line);
        server
            .get_mut()
            .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
            .await
            .unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "BEGIN\r\n");

        let hello = Message::decode(&wire::read_frame(&mut server).await.unwrap()).unwrap();
        assert_eq!(hello.destination.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(hello.member.as_deref(), Some("Hello"));
        let mut reply = Message::method_return(&hello, &[str_value(":1.42")]).unwrap();
        reply.serial = 1;
        let bytes = reply.encode().unwrap();
        server.get_mut().write_all(&bytes).await.unwrap();
    });
    assert_eq!(connection.unwrap().unique_name(), Some(":1.42"));
}

#[tokio::test]
async fn test_handshake_rejected() {
    init_logger();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (connection, ()) = tokio::join!(Builder::system().handshake(client), async move {
        let mut server = BufReader::new(server);
        server.read_u8().await.unwrap();
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        server
            .get_mut()
            .write_all(b"REJECTED DBUS_COOKIE_SHA1\r\n")
            .await
            .unwrap();
    });
    assert!(matches!(connection, Err(Error::AuthRejected(_))));
}

#[tokio::test]
async fn test_unreachable_socket() {
    init_logger();
    let result = Builder::system()
        .address("unix:path=/nonexistent/systemd-control/bus")
        .connect()
        .await;
    assert!(matches!(result, Err(Error::DBusConnectionFail(_))));

    let result = Builder::system()
        .address("tcp:host=localhost,port=1")
        .connect()
        .await;
    assert!(matches!(result, Err(Error::UnsupportedAddress(_))));
}
