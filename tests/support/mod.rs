#![allow(dead_code)] // each test binary uses a subset of these helpers

use rudis::{Config, Connection, PushKind, Value, VerbatimFormat};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A scripted stand-in for a Redis server: tests accept connections,
/// assert on the exact commands that arrive and answer with raw RESP
/// bytes or encoded values.
pub struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub async fn bind() -> (MockServer, Config) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::new().with_host("127.0.0.1").with_port(port);
        (MockServer { listener }, config)
    }

    pub async fn accept(&self) -> ServerSession {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .unwrap();
        ServerSession {
            stream,
            buf: Vec::new(),
        }
    }
}

/// One accepted client connection on the mock server.
pub struct ServerSession {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ServerSession {
    /// Reads exactly one inbound command (an array of bulk strings).
    pub async fn read_command(&mut self) -> Vec<Vec<u8>> {
        loop {
            if let Some((args, consumed)) = parse_command(&self.buf) {
                self.buf.drain(..consumed);
                return args;
            }
            let mut chunk = [0u8; 4096];
            let read = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a command")
                .unwrap();
            assert!(read > 0, "connection closed while waiting for a command");
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Reads one command and asserts its exact arguments.
    pub async fn expect(&mut self, parts: &[&str]) {
        let args = self.read_command().await;
        let args: Vec<String> = args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        assert_eq!(args, parts, "unexpected command on the wire");
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send_value(&mut self, value: &Value) {
        let mut out = Vec::new();
        encode_value(value, &mut out);
        self.send(&out).await;
    }

    /// Asserts that nothing arrives on the wire for `wait`.
    pub async fn assert_no_traffic(&mut self, wait: Duration) {
        assert!(
            self.buf.is_empty(),
            "unexpected buffered traffic: {:?}",
            String::from_utf8_lossy(&self.buf)
        );
        let mut chunk = [0u8; 4096];
        tokio::select! {
            read = self.stream.read(&mut chunk) => {
                let read = read.unwrap();
                assert!(read > 0, "connection closed while expecting silence");
                panic!(
                    "unexpected traffic: {:?}",
                    String::from_utf8_lossy(&chunk[..read])
                );
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Answers a `HELLO 3` with a RESP3 handshake map.
    pub async fn handshake_resp3(&mut self) {
        let args = self.read_command().await;
        assert_eq!(args[0], b"HELLO");
        assert_eq!(args[1], b"3");
        self.send_value(&Value::Map(vec![
            (Value::BulkString(b"proto".to_vec()), Value::Int(3)),
            (
                Value::BulkString(b"role".to_vec()),
                Value::BulkString(b"master".to_vec()),
            ),
        ]))
        .await;
    }

    /// Rejects `HELLO` the way a pre-RESP3 server does.
    pub async fn handshake_resp2(&mut self) {
        let args = self.read_command().await;
        assert_eq!(args[0], b"HELLO");
        self.send(b"-ERR unknown command 'HELLO'\r\n").await;
    }
}

/// Connects a client against the mock server, driving the RESP3
/// handshake on its behalf.
pub async fn connect_resp3(server: &MockServer, config: Config) -> (Connection, ServerSession) {
    let task = tokio::spawn(Connection::connect(config));
    let mut session = server.accept().await;
    session.handshake_resp3().await;
    let connection = task.await.unwrap().unwrap();
    (connection, session)
}

/// Connects a client against the mock server, forcing the RESP2
/// fallback.
pub async fn connect_resp2(server: &MockServer, config: Config) -> (Connection, ServerSession) {
    let task = tokio::spawn(Connection::connect(config));
    let mut session = server.accept().await;
    session.handshake_resp2().await;
    let connection = task.await.unwrap().unwrap();
    (connection, session)
}

fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let haystack = &buf[*pos..];
    let at = haystack.windows(2).position(|window| window == b"\r\n")?;
    *pos += at + 2;
    Some(&haystack[..at])
}

/// Parses one client command (array of bulk strings) from the front of
/// `buf`; `None` while incomplete.
fn parse_command(buf: &[u8]) -> Option<(Vec<Vec<u8>>, usize)> {
    let mut pos = 0;
    let line = read_line(buf, &mut pos)?;
    assert!(
        line.starts_with(b"*"),
        "expected an array command, got {:?}",
        String::from_utf8_lossy(line)
    );
    let count: usize = std::str::from_utf8(&line[1..]).unwrap().parse().unwrap();
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let line = read_line(buf, &mut pos)?;
        assert!(line.starts_with(b"$"), "expected a bulk string argument");
        let len: usize = std::str::from_utf8(&line[1..]).unwrap().parse().unwrap();
        if buf.len() < pos + len + 2 {
            return None;
        }
        args.push(buf[pos..pos + len].to_vec());
        pos += len + 2;
    }
    Some((args, pos))
}

fn push_event_name(kind: &PushKind) -> &str {
    match kind {
        PushKind::Message => "message",
        PushKind::PMessage => "pmessage",
        PushKind::SMessage => "smessage",
        PushKind::Subscribe => "subscribe",
        PushKind::PSubscribe => "psubscribe",
        PushKind::SSubscribe => "ssubscribe",
        PushKind::Unsubscribe => "unsubscribe",
        PushKind::PUnsubscribe => "punsubscribe",
        PushKind::SUnsubscribe => "sunsubscribe",
        PushKind::Invalidate => "invalidate",
        PushKind::Other(name) => name,
    }
}

fn format_double(value: f64) -> String {
    if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value}")
    }
}

/// Encodes a value in its canonical RESP3 wire form.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.extend_from_slice(b"_\r\n"),
        Value::Int(value) => out.extend_from_slice(format!(":{value}\r\n").as_bytes()),
        Value::BulkString(bytes) => {
            out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        Value::SimpleString(text) => out.extend_from_slice(format!("+{text}\r\n").as_bytes()),
        Value::Okay => out.extend_from_slice(b"+OK\r\n"),
        Value::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Map(pairs) => {
            out.extend_from_slice(format!("%{}\r\n", pairs.len()).as_bytes());
            for (key, value) in pairs {
                encode_value(key, out);
                encode_value(value, out);
            }
        }
        Value::Set(items) => {
            out.extend_from_slice(format!("~{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Double(value) => {
            out.extend_from_slice(format!(",{}\r\n", format_double(*value)).as_bytes())
        }
        Value::Boolean(true) => out.extend_from_slice(b"#t\r\n"),
        Value::Boolean(false) => out.extend_from_slice(b"#f\r\n"),
        Value::VerbatimString { format, text } => {
            let tag = match format {
                VerbatimFormat::Text => "txt",
                VerbatimFormat::Markdown => "mkd",
                VerbatimFormat::Unknown(tag) => tag,
            };
            out.extend_from_slice(format!("={}\r\n{tag}:{text}\r\n", text.len() + 4).as_bytes());
        }
        Value::BigNumber(value) => out.extend_from_slice(format!("({value}\r\n").as_bytes()),
        Value::ServerError(err) => out.extend_from_slice(format!("-{err}\r\n").as_bytes()),
        Value::Attribute { data, attributes } => {
            out.extend_from_slice(format!("|{}\r\n", attributes.len()).as_bytes());
            for (key, value) in attributes {
                encode_value(key, out);
                encode_value(value, out);
            }
            encode_value(data, out);
        }
        Value::Push { kind, data } => {
            out.extend_from_slice(format!(">{}\r\n", data.len() + 1).as_bytes());
            let name = push_event_name(kind);
            out.extend_from_slice(format!("${}\r\n{name}\r\n", name.len()).as_bytes());
            for item in data {
                encode_value(item, out);
            }
        }
    }
}
