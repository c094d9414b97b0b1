//! WebSocket client transport (RFC 6455).
//!
//! NDT encapsulates its messages in WebSocket framing when the caller asks
//! for it, so this is a complete client: upgrade handshake, frame codec,
//! and control-frame handling.
//!
//! ## Frame layout
//!
//! ```text
//! offset
//!    0  FIN(1) RSV(3) OPCODE(4)
//!    1  MASK(1) LEN(7)
//!       LEN == 126 → u16 length, big-endian
//!       LEN == 127 → u64 length, big-endian (top bit zero)
//!       4-byte masking key (client→server only)
//! ------
//!    payload (XOR-masked with the key when the MASK bit is set)
//! ```
//!
//! Client frames always carry a random mask; a masked frame *from* the
//! server is a protocol violation, as are non-zero RSV bits.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ErrKind, Error, Result};
use crate::netx;

/// Continuation frame of a fragmented message.
pub(crate) const OP_CONTINUE: u8 = 0;
/// UTF-8 text message.
pub(crate) const OP_TEXT: u8 = 1;
/// Binary message.
pub(crate) const OP_BINARY: u8 = 2;
/// Connection close.
pub(crate) const OP_CLOSE: u8 = 8;
/// Keep-alive probe; answered with a pong.
pub(crate) const OP_PING: u8 = 9;
/// Keep-alive answer; discarded on receipt.
pub(crate) const OP_PONG: u8 = 10;

/// FIN bit of the first frame octet.
pub(crate) const FIN_FLAG: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASK_FLAG: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADER_LINE: usize = 8192;

/// Headers the upgrade response is required to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct WsFlags(u8);

impl WsFlags {
    pub(crate) const CONNECTION: WsFlags = WsFlags(1 << 0);
    pub(crate) const SEC_WS_ACCEPT: WsFlags = WsFlags(1 << 1);
    pub(crate) const SEC_WS_PROTOCOL: WsFlags = WsFlags(1 << 2);
    pub(crate) const UPGRADE: WsFlags = WsFlags(1 << 3);
    pub(crate) const ALL: WsFlags = WsFlags(0b1111);

    pub(crate) const fn contains(self, other: WsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: WsFlags) {
        self.0 |= other.0;
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a handshake key, per
/// RFC 6455 §4.1: `base64(SHA1(key || magic-GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn proto_err(cause: &str) -> Error {
    Error::with_cause(ErrKind::WsProto, cause)
}

/// One parsed frame header plus the number of payload bytes delivered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) opcode: u8,
    pub(crate) fin: bool,
    pub(crate) len: usize,
}

/// A WebSocket connection in client role.
pub(crate) struct WsStream<S> {
    stream: S,
    timeout: Duration,
    rng: SmallRng,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsStream<S> {
    /// Upgrade `stream` to WebSocket. `required` selects which response
    /// headers must be present; present headers are validated either way.
    pub(crate) async fn handshake(
        stream: S,
        hostname: &str,
        port: u16,
        required: WsFlags,
        protocol: &str,
        timeout: Duration,
    ) -> Result<WsStream<S>> {
        let mut ws = WsStream {
            stream,
            timeout,
            rng: SmallRng::from_os_rng(),
        };

        let mut key_bytes = [0u8; 16];
        ws.rng.fill_bytes(&mut key_bytes);
        let key = BASE64.encode(key_bytes);

        let request = format!(
            "GET /ndt_protocol HTTP/1.1\r\n\
             Host: {hostname}:{port}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Protocol: {protocol}\r\n\r\n"
        );
        netx::write_all(&mut ws.stream, request.as_bytes(), timeout).await?;

        let status = ws.recv_line().await?;
        if !status.starts_with("HTTP/1.1 101") {
            return Err(proto_err(&format!("unexpected status line: {status}")));
        }

        let mut seen = WsFlags::default();
        loop {
            let line = ws.recv_line().await?;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(proto_err("malformed response header"));
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "connection" => {
                    if !value.to_ascii_lowercase().contains("upgrade") {
                        return Err(proto_err("Connection header does not request upgrade"));
                    }
                    seen.insert(WsFlags::CONNECTION);
                }
                "upgrade" => {
                    if !value.eq_ignore_ascii_case("websocket") {
                        return Err(proto_err("Upgrade header is not websocket"));
                    }
                    seen.insert(WsFlags::UPGRADE);
                }
                "sec-websocket-accept" => {
                    if value != accept_key(&key) {
                        return Err(proto_err("Sec-WebSocket-Accept mismatch"));
                    }
                    seen.insert(WsFlags::SEC_WS_ACCEPT);
                }
                "sec-websocket-protocol" => {
                    if value != protocol {
                        return Err(proto_err("Sec-WebSocket-Protocol not echoed"));
                    }
                    seen.insert(WsFlags::SEC_WS_PROTOCOL);
                }
                _ => {}
            }
        }
        if !seen.contains(required) {
            return Err(proto_err("required handshake header missing"));
        }
        Ok(ws)
    }

    /// Read one CRLF-terminated header line, capped at [`MAX_HEADER_LINE`].
    async fn recv_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            netx::read_exact(&mut self.stream, &mut byte, self.timeout).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_HEADER_LINE {
                return Err(proto_err("response header line too long"));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| proto_err("non-UTF-8 response header"))
    }

    /// Send one frame. `first_byte` is the complete first octet (FIN, RSV,
    /// opcode); the mask bit and a fresh random key are applied here.
    pub(crate) async fn send_frame(&mut self, first_byte: u8, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; 14];
        header[0] = first_byte;
        let mut n = 2;
        if payload.len() < 126 {
            header[1] = MASK_FLAG | payload.len() as u8;
        } else if payload.len() <= u16::MAX as usize {
            header[1] = MASK_FLAG | 126;
            header[2..4].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            n = 4;
        } else {
            header[1] = MASK_FLAG | 127;
            header[2..10].copy_from_slice(&(payload.len() as u64).to_be_bytes());
            n = 10;
        }
        let mut mask = [0u8; 4];
        self.rng.fill_bytes(&mut mask);
        header[n..n + 4].copy_from_slice(&mask);
        n += 4;

        netx::write_all(&mut self.stream, &header[..n], self.timeout).await?;
        let mut masked = payload.to_vec();
        for (i, byte) in masked.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }
        netx::write_all(&mut self.stream, &masked, self.timeout).await
    }

    /// Send a complete single-frame message.
    pub(crate) async fn send_msg(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        self.send_frame(FIN_FLAG | opcode, payload).await
    }

    /// Receive any frame, control or data, into `buf`. Fails with
    /// `message_size` when the payload exceeds the buffer.
    pub(crate) async fn recv_any_frame(&mut self, buf: &mut [u8]) -> Result<Frame> {
        let mut head = [0u8; 2];
        netx::read_exact(&mut self.stream, &mut head, self.timeout).await?;
        if head[0] & RSV_MASK != 0 {
            return Err(proto_err("non-zero reserved bits"));
        }
        if head[1] & MASK_FLAG != 0 {
            return Err(proto_err("masked frame from server"));
        }
        let opcode = head[0] & OPCODE_MASK;
        let fin = head[0] & FIN_FLAG != 0;

        let len = match head[1] & LEN_MASK {
            126 => {
                let mut ext = [0u8; 2];
                netx::read_exact(&mut self.stream, &mut ext, self.timeout).await?;
                u16::from_be_bytes(ext) as u64
            }
            127 => {
                let mut ext = [0u8; 8];
                netx::read_exact(&mut self.stream, &mut ext, self.timeout).await?;
                let len = u64::from_be_bytes(ext);
                if len & (1 << 63) != 0 {
                    return Err(proto_err("frame length top bit set"));
                }
                len
            }
            small => small as u64,
        };
        if len > buf.len() as u64 {
            return Err(Error::new(ErrKind::MessageSize));
        }
        let len = len as usize;
        netx::read_exact(&mut self.stream, &mut buf[..len], self.timeout).await?;
        Ok(Frame { opcode, fin, len })
    }

    /// Receive the next data frame. PING is answered inline, PONG is
    /// discarded, and CLOSE is echoed before reporting `eof`.
    pub(crate) async fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Frame> {
        loop {
            let frame = self.recv_any_frame(buf).await?;
            if frame.opcode >= OP_CLOSE && (!frame.fin || frame.len > 125) {
                return Err(proto_err("fragmented or oversized control frame"));
            }
            match frame.opcode {
                OP_PING => {
                    let echo = buf[..frame.len].to_vec();
                    self.send_frame(FIN_FLAG | OP_PONG, &echo).await?;
                }
                OP_PONG => {}
                OP_CLOSE => {
                    let echo = buf[..frame.len].to_vec();
                    let _ = self.send_frame(FIN_FLAG | OP_CLOSE, &echo).await;
                    return Err(Error::new(ErrKind::Eof));
                }
                _ => return Ok(frame),
            }
        }
    }

    /// Receive one complete message, reassembling fragments. Returns the
    /// message opcode and total length. Control frames arriving mid-message
    /// are handled transparently.
    pub(crate) async fn recv_msg(&mut self, buf: &mut [u8]) -> Result<(u8, usize)> {
        let mut total = 0;
        let mut message_opcode = None;
        loop {
            let frame = self.recv_frame(&mut buf[total..]).await?;
            match message_opcode {
                None => match frame.opcode {
                    OP_TEXT | OP_BINARY => message_opcode = Some(frame.opcode),
                    _ => return Err(proto_err("message does not start with a data frame")),
                },
                Some(_) => {
                    if frame.opcode != OP_CONTINUE {
                        return Err(proto_err("expected continuation frame"));
                    }
                }
            }
            total += frame.len;
            if frame.fin {
                // message_opcode is always set by the first iteration
                return Ok((message_opcode.unwrap_or(OP_BINARY), total));
            }
        }
    }

    /// Announce closure and shut down the write direction.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.send_frame(FIN_FLAG | OP_CLOSE, &[]).await;
        netx::shutdown_write(&mut self.stream, self.timeout).await;
    }
}
