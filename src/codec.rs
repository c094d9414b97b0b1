//! NDT message codec over a raw or WebSocket transport.
//!
//! The base wire format ("legacy") is a 3-byte header followed by the
//! payload:
//!
//! ```text
//! offset
//!    0  message type
//!    1  ┐ payload length (u16, big-endian, max 65535)
//!    2  ┘
//! ------
//!    payload (length bytes)
//! ```
//!
//! Two options stack on top, independently: JSON bodies, where the payload
//! becomes `{"msg": "<body>"}`, and WebSocket transport, where each NDT
//! message (header included) travels as one binary WebSocket message.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ErrKind, Error, Result};
use crate::netx;
use crate::params;
use crate::settings::NettestFlags;
use crate::ws::{self, WsStream};

/// NDT control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgType {
    CommFailure = 0,
    SrvQueue = 1,
    Login = 2,
    TestPrepare = 3,
    TestStart = 4,
    TestMsg = 5,
    TestFinalize = 6,
    Error = 7,
    Results = 8,
    Logout = 9,
    Waiting = 10,
    ExtendedLogin = 11,
}

impl MsgType {
    pub(crate) fn from_u8(code: u8) -> Option<MsgType> {
        match code {
            0 => Some(MsgType::CommFailure),
            1 => Some(MsgType::SrvQueue),
            2 => Some(MsgType::Login),
            3 => Some(MsgType::TestPrepare),
            4 => Some(MsgType::TestStart),
            5 => Some(MsgType::TestMsg),
            6 => Some(MsgType::TestFinalize),
            7 => Some(MsgType::Error),
            8 => Some(MsgType::Results),
            9 => Some(MsgType::Logout),
            10 => Some(MsgType::Waiting),
            11 => Some(MsgType::ExtendedLogin),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

enum Transport<S> {
    Raw(S),
    Ws(WsStream<S>),
}

/// One NDT connection: a transport plus the body codec selected for the
/// session. Owns the underlying socket; dropping it closes the connection.
pub(crate) struct Connection<S> {
    transport: Transport<S>,
    json: bool,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap a plain stream.
    pub(crate) fn raw(stream: S, json: bool, timeout: Duration) -> Connection<S> {
        Connection {
            transport: Transport::Raw(stream),
            json,
            timeout,
        }
    }

    /// Wrap an upgraded WebSocket stream.
    pub(crate) fn websocket(stream: WsStream<S>, json: bool, timeout: Duration) -> Connection<S> {
        Connection {
            transport: Transport::Ws(stream),
            json,
            timeout,
        }
    }

    pub(crate) fn is_websocket(&self) -> bool {
        matches!(self.transport, Transport::Ws(_))
    }

    /// Write a message, wrapping the body in JSON when enabled.
    pub(crate) async fn msg_write(&mut self, msg_type: MsgType, body: &str) -> Result<()> {
        if self.json {
            let wrapped = serde_json::json!({ "msg": body }).to_string();
            self.msg_write_legacy(msg_type, wrapped.as_bytes()).await
        } else {
            self.msg_write_legacy(msg_type, body.as_bytes()).await
        }
    }

    /// Write the login message. Extended login carries the version and the
    /// test set as JSON; plain login is the raw flags byte.
    pub(crate) async fn msg_write_login(
        &mut self,
        version: &str,
        flags: NettestFlags,
    ) -> Result<()> {
        if self.json {
            let body = serde_json::json!({
                "msg": version,
                "tests": flags.bits().to_string(),
            })
            .to_string();
            self.msg_write_legacy(MsgType::ExtendedLogin, body.as_bytes())
                .await
        } else {
            self.msg_write_legacy(MsgType::Login, &[flags.bits()]).await
        }
    }

    async fn msg_write_legacy(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<()> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::new(ErrKind::MessageSize));
        }
        let mut wire = Vec::with_capacity(3 + payload.len());
        wire.push(msg_type.code());
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(payload);
        match &mut self.transport {
            Transport::Raw(stream) => netx::write_all(stream, &wire, self.timeout).await,
            Transport::Ws(stream) => stream.send_msg(ws::OP_BINARY, &wire).await,
        }
    }

    /// Read one message, unwrapping the JSON body when enabled.
    pub(crate) async fn msg_read(&mut self) -> Result<(MsgType, String)> {
        let (msg_type, payload) = self.msg_read_legacy().await?;
        let text = String::from_utf8(payload)
            .map_err(|_| Error::with_cause(ErrKind::InvalidArgument, "non-UTF-8 message body"))?;
        if !self.json || text.is_empty() {
            return Ok((msg_type, text));
        }
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            Error::with_cause(ErrKind::InvalidArgument, format!("bad JSON body: {e}"))
        })?;
        let body = value
            .get("msg")
            .and_then(|m| m.as_str())
            .ok_or_else(|| Error::with_cause(ErrKind::InvalidArgument, "missing msg field"))?;
        Ok((msg_type, body.to_string()))
    }

    async fn msg_read_legacy(&mut self) -> Result<(MsgType, Vec<u8>)> {
        match &mut self.transport {
            Transport::Raw(stream) => {
                let mut head = [0u8; 3];
                netx::read_exact(stream, &mut head, self.timeout).await?;
                let msg_type = MsgType::from_u8(head[0]).ok_or_else(|| {
                    Error::with_cause(
                        ErrKind::InvalidArgument,
                        format!("unknown message type {}", head[0]),
                    )
                })?;
                let len = u16::from_be_bytes([head[1], head[2]]) as usize;
                let mut payload = vec![0u8; len];
                netx::read_exact(stream, &mut payload, self.timeout).await?;
                Ok((msg_type, payload))
            }
            Transport::Ws(stream) => {
                let mut buf = vec![0u8; 3 + u16::MAX as usize];
                let (_opcode, count) = stream.recv_msg(&mut buf).await?;
                if count < 3 {
                    return Err(Error::with_cause(
                        ErrKind::InvalidArgument,
                        "short NDT message",
                    ));
                }
                let msg_type = MsgType::from_u8(buf[0]).ok_or_else(|| {
                    Error::with_cause(
                        ErrKind::InvalidArgument,
                        format!("unknown message type {}", buf[0]),
                    )
                })?;
                let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                if count != 3 + len {
                    return Err(Error::new(ErrKind::MessageSize));
                }
                buf.truncate(count);
                buf.drain(..3);
                Ok((msg_type, buf))
            }
        }
    }

    /// Read a message that must be of type `want`.
    pub(crate) async fn msg_expect(&mut self, want: MsgType) -> Result<String> {
        let (msg_type, body) = self.msg_read().await?;
        if msg_type != want {
            return Err(Error::with_cause(
                ErrKind::InvalidArgument,
                format!("expected {want:?}, received {msg_type:?}"),
            ));
        }
        Ok(body)
    }

    /// Read a message that must be of type `want` and carry no body.
    pub(crate) async fn msg_expect_empty(&mut self, want: MsgType) -> Result<()> {
        let body = self.msg_expect(want).await?;
        if !body.is_empty() {
            return Err(Error::with_cause(
                ErrKind::InvalidArgument,
                format!("expected empty {want:?}, received {body:?}"),
            ));
        }
        Ok(())
    }

    /// Read a TEST_PREPARE message and parse `<port> [nflows]`.
    pub(crate) async fn msg_expect_test_prepare(&mut self) -> Result<(u16, u8)> {
        let body = self.msg_expect(MsgType::TestPrepare).await?;
        parse_test_prepare(&body)
    }

    /// Read raw bytes from the data plane: a plain read, or one WebSocket
    /// message. End of stream surfaces as `eof`.
    pub(crate) async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.transport {
            Transport::Raw(stream) => netx::read_some(stream, buf, self.timeout).await,
            Transport::Ws(stream) => {
                let (_opcode, count) = stream.recv_msg(buf).await?;
                Ok(count)
            }
        }
    }

    /// Read exactly `buf.len()` raw bytes. Only meaningful on a raw
    /// transport (the kickoff greeting predates WebSocket support).
    pub(crate) async fn read_exact_data(&mut self, buf: &mut [u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Raw(stream) => netx::read_exact(stream, buf, self.timeout).await,
            Transport::Ws(_) => Err(Error::new(ErrKind::FunctionNotSupported)),
        }
    }

    /// Write raw bytes to the data plane: a plain write, or one binary
    /// WebSocket message.
    pub(crate) async fn write_data(&mut self, payload: &[u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Raw(stream) => netx::write_all(stream, payload, self.timeout).await,
            Transport::Ws(stream) => stream.send_msg(ws::OP_BINARY, payload).await,
        }
    }

    /// Gracefully shut down the write direction, announcing closure first
    /// on WebSocket transports.
    pub(crate) async fn shutdown_write(&mut self) {
        match &mut self.transport {
            Transport::Raw(stream) => netx::shutdown_write(stream, self.timeout).await,
            Transport::Ws(stream) => stream.shutdown().await,
        }
    }
}

/// Parse a decimal integer within `[min, max]`.
pub(crate) fn parse_bounded(text: &str, min: i64, max: i64) -> Result<i64> {
    let value: i64 = text.trim().parse().map_err(|_| {
        Error::with_cause(ErrKind::InvalidArgument, format!("not a number: {text:?}"))
    })?;
    if value < min || value > max {
        return Err(Error::with_cause(
            ErrKind::InvalidArgument,
            format!("{value} outside {min}..={max}"),
        ));
    }
    Ok(value)
}

/// TEST_PREPARE body: the data port, then optionally the number of parallel
/// flows for the `_ext` subtests. Extra trailing tokens from legacy servers
/// are ignored.
fn parse_test_prepare(body: &str) -> Result<(u16, u8)> {
    let mut tokens = body.split_whitespace();
    let port_token = tokens
        .next()
        .ok_or_else(|| Error::with_cause(ErrKind::InvalidArgument, "empty TEST_PREPARE"))?;
    let port = parse_bounded(port_token, 1, 65535)? as u16;
    let nflows = match tokens.next() {
        None => 1,
        Some(token) => {
            let n = parse_bounded(token, 1, 255)? as u8;
            n.min(params::MAX_FLOWS)
        }
    };
    Ok((port, nflows))
}
