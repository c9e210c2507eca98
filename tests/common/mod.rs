//! An in-memory stand-in for the system bus.
#![allow(dead_code)]

use std::time::Duration;

use systemd_control::wire::{self, Message, MessageType, Reply, Value};
use systemd_control::{Builder, Connection};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

pub struct MockBus {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    serial: u32,
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A connection whose other end is the returned mock bus.
pub fn connect(call_timeout: Duration) -> (Connection, MockBus) {
    connect_with_buffer(call_timeout, 64 * 1024)
}

/// Like [connect], with at most `max_buf` bytes in flight each way.
pub fn connect_with_buffer(call_timeout: Duration, max_buf: usize) -> (Connection, MockBus) {
    init_logger();
    let (client, server) = tokio::io::duplex(max_buf);
    let connection = Builder::system().call_timeout(call_timeout).attach(client);
    (connection, MockBus::new(server))
}

pub fn unit_path(name: &str) -> String {
    systemd_control::UnitRef::from_name(name)
        .unwrap()
        .path()
        .as_str()
        .to_owned()
}

/// The `(interface, property)` arguments of a `Properties.Get` call.
pub fn property_of(call: &Message) -> (String, String) {
    match call.body().unwrap().as_slice() {
        [Value::Str(interface), Value::Str(property)] => {
            (interface.as_str().to_owned(), property.as_str().to_owned())
        }
        other => panic!("not a Properties.Get call: {:?}", other),
    }
}

pub fn str_value(s: &str) -> Value<'static> {
    Value::from(s.to_owned())
}

pub fn path_value(s: &str) -> Value<'static> {
    Value::ObjectPath(s.to_owned().try_into().unwrap())
}

pub fn strings_value(items: &[&str]) -> Value<'static> {
    Value::from(items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
}

pub fn variant(v: Value<'static>) -> Value<'static> {
    Value::Value(Box::new(v))
}

impl MockBus {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            serial: 0,
        }
    }

    pub async fn next_call(&mut self) -> Message {
        let frame = wire::read_frame(&mut self.reader)
            .await
            .expect("should receive a message");
        let message = Message::decode(&frame).expect("should decode the message");
        assert_eq!(message.message_type, MessageType::MethodCall);
        message
    }

    pub async fn reply(&mut self, call: &Message, body: &[Value<'_>]) {
        let reply = Message::method_return(call, body).expect("should encode the reply");
        self.send(reply).await;
    }

    pub async fn reply_error(&mut self, call: &Message, name: &str, text: &str) {
        let reply = Message::error(call, name, text).expect("should encode the error");
        self.send(reply).await;
    }

    /// Write bytes as they are, framed or not.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer
            .write_all(bytes)
            .await
            .expect("should send the bytes");
    }

    pub async fn send(&mut self, mut message: Message) {
        self.serial += 1;
        message.serial = self.serial;
        self.writer
            .write_all(&message.encode().expect("should encode the message"))
            .await
            .expect("should send the message");
    }

    /// Answer every call with `handler` until the connection goes away.
    pub async fn serve<F>(mut self, mut handler: F)
    where
        F: FnMut(&Message) -> Reply,
    {
        while let Ok(frame) = wire::read_frame(&mut self.reader).await {
            let call = Message::decode(&frame).expect("should decode the message");
            match handler(&call) {
                Reply::Return(body) => self.reply(&call, &body).await,
                Reply::Error { name, message } => self.reply_error(&call, &name, &message).await,
            }
        }
    }
}
