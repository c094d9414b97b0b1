//! Scripted NDT server pieces and recording doubles shared by the
//! end-to-end tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndt_client::emitter::{Emitter, ResultScope};
use ndt_client::error::{ErrKind, Error, Result};
use ndt_client::locate::{MlabnsPolicy, ServerDirectory};
use ndt_client::netx::Resolver;
use ndt_client::settings::Nettest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const MSG_SRV_QUEUE: u8 = 1;
pub const MSG_LOGIN: u8 = 2;
pub const MSG_TEST_PREPARE: u8 = 3;
pub const MSG_TEST_START: u8 = 4;
pub const MSG_TEST_MSG: u8 = 5;
pub const MSG_TEST_FINALIZE: u8 = 6;
pub const MSG_RESULTS: u8 = 8;
pub const MSG_LOGOUT: u8 = 9;
pub const MSG_EXTENDED_LOGIN: u8 = 11;

/// Send one legacy NDT message.
pub async fn send_msg(stream: &mut TcpStream, code: u8, payload: &[u8]) {
    let mut wire = vec![code];
    wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    wire.extend_from_slice(payload);
    stream.write_all(&wire).await.unwrap();
}

/// Receive one legacy NDT message.
pub async fn recv_msg(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await.unwrap();
    let len = u16::from_be_bytes([head[1], head[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (head[0], payload)
}

/// Send the legacy 13-byte greeting.
pub async fn send_kickoff(stream: &mut TcpStream) {
    stream.write_all(b"123456 654321").await.unwrap();
}

/// Accept a WebSocket upgrade, echoing the offered subprotocol. Returns
/// the subprotocol.
pub async fn ws_accept(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        request.push(byte[0]);
    }
    let text = String::from_utf8(request).unwrap();
    let key = text
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .expect("handshake key")
        .to_string();
    let protocol = text
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Protocol: "))
        .expect("handshake subprotocol")
        .to_string();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {}\r\n\r\n",
        ndt_client::ws::accept_key(&key),
        protocol
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    protocol
}

/// Send one single-frame WebSocket message, unmasked (server role).
pub async fn ws_send_msg(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let mut frame = vec![0x80 | opcode];
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

/// Receive one WebSocket frame, unmasking client payloads. Returns `None`
/// on a closed or broken connection.
pub async fn ws_recv_msg(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.ok()?;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    let mut len = (head[1] & 0x7f) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.ok()?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.ok()?;
        len = u64::from_be_bytes(ext);
    }
    let mut mask = [0u8; 4];
    if masked {
        stream.read_exact(&mut mask).await.ok()?;
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }
    }
    Some((opcode, payload))
}

/// Send one NDT message inside a binary WebSocket message.
pub async fn ws_send_ndt(stream: &mut TcpStream, code: u8, payload: &[u8]) {
    let mut wire = vec![code];
    wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    wire.extend_from_slice(payload);
    ws_send_msg(stream, 2, &wire).await;
}

/// Receive one NDT message from a binary WebSocket message.
pub async fn ws_recv_ndt(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let (opcode, message) = ws_recv_msg(stream).await.expect("NDT message");
    assert_eq!(opcode, 2, "NDT messages travel as binary frames");
    assert!(message.len() >= 3);
    let len = u16::from_be_bytes([message[1], message[2]]) as usize;
    assert_eq!(message.len(), 3 + len);
    (message[0], message[3..].to_vec())
}

/// One recorded emitter event.
#[derive(Debug, Clone)]
pub enum Event {
    Warning(String),
    Info(String),
    Debug(String),
    Performance {
        subtest: &'static str,
        nflows: u8,
        bytes: f64,
        interval: f64,
        elapsed: f64,
    },
    Result {
        scope: &'static str,
        name: String,
        value: String,
    },
    Busy(String),
}

/// Shared event log; clone freely, inspect after the run.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn performances(&self) -> Vec<(&'static str, u8, f64, f64, f64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Performance {
                    subtest,
                    nflows,
                    bytes,
                    interval,
                    elapsed,
                } => Some((subtest, nflows, bytes, interval, elapsed)),
                _ => None,
            })
            .collect()
    }

    pub fn results(&self) -> Vec<(&'static str, String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Result { scope, name, value } => Some((scope, name, value)),
                _ => None,
            })
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Busy(_)))
            .count()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Debug(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }
}

/// Emitter double that records every callback.
pub struct RecordingEmitter(pub Recorder);

impl Emitter for RecordingEmitter {
    fn on_warning(&mut self, msg: &str) {
        self.0.push(Event::Warning(msg.to_string()));
    }

    fn on_info(&mut self, msg: &str) {
        self.0.push(Event::Info(msg.to_string()));
    }

    fn on_debug(&mut self, msg: &str) {
        self.0.push(Event::Debug(msg.to_string()));
    }

    fn on_performance(
        &mut self,
        subtest: Nettest,
        nflows: u8,
        measured_bytes: f64,
        interval: f64,
        elapsed: f64,
        _max_runtime: f64,
    ) {
        self.0.push(Event::Performance {
            subtest: subtest.label(),
            nflows,
            bytes: measured_bytes,
            interval,
            elapsed,
        });
    }

    fn on_result(&mut self, scope: ResultScope, name: &str, value: &str) {
        self.0.push(Event::Result {
            scope: scope.as_str(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    fn on_server_busy(&mut self, reason: &str) {
        self.0.push(Event::Busy(reason.to_string()));
    }
}

/// Resolver double mapping every hostname to one address.
pub struct FixedResolver(pub IpAddr);

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, _hostname: &str) -> Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

/// Resolver double that refuses every query, proving no DNS happens.
pub struct FailingResolver;

#[async_trait]
impl Resolver for FailingResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        Err(Error::with_cause(
            ErrKind::AiFail,
            format!("unexpected resolution of {hostname:?}"),
        ))
    }
}

/// Directory double returning a fixed candidate list.
pub struct FixedDirectory(pub Vec<String>);

#[async_trait]
impl ServerDirectory for FixedDirectory {
    async fn nearby(&self, _policy: MlabnsPolicy) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}
