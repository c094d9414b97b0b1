//! Networking support: hostname resolution, TCP dialing, the
//! plain-or-TLS stream, and timeout-wrapped exact I/O.
//!
//! Every operation here maps failures into the [`ErrKind`] taxonomy; no
//! raw `io::Error` escapes upward.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{ErrKind, Error, Result};

/// Hostname resolution seam. The production impl uses the system resolver;
/// tests inject fixed tables or resolvers that always fail.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `hostname` to addresses, order preserved.
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
}

/// [`Resolver`] backed by the operating system.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((hostname, 0u16))
            .await
            .map_err(|e| Error::with_cause(ErrKind::AiGeneric, e.to_string()))?;
        let ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        if ips.is_empty() {
            return Err(Error::new(ErrKind::AiNoname));
        }
        Ok(ips)
    }
}

/// Connect to `hostname:port`, trying each resolved address in order under
/// `timeout`. Returns the first successful connection, else the last error.
pub(crate) async fn dial_tcp(
    resolver: &dyn Resolver,
    hostname: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream> {
    let addrs = resolver.resolve(hostname).await?;
    let mut last = Error::new(ErrKind::AiNoname);
    for ip in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => last = err.into(),
            Err(_) => last = Error::new(ErrKind::TimedOut),
        }
    }
    Err(last)
}

/// Read at most `buf.len()` bytes. A clean close maps to [`ErrKind::Eof`];
/// expiry of `timeout` to [`ErrKind::TimedOut`].
pub(crate) async fn read_some<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(0)) => Err(Error::new(ErrKind::Eof)),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::new(ErrKind::TimedOut)),
    }
}

/// Read exactly `buf.len()` bytes or fail. Partial progress at `timeout`
/// expiry reports [`ErrKind::TimedOut`].
pub(crate) async fn read_exact<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::new(ErrKind::TimedOut)),
    }
}

/// Write all of `buf` or fail. Partial progress at `timeout` expiry reports
/// [`ErrKind::TimedOut`].
pub(crate) async fn write_all<S>(stream: &mut S, buf: &[u8], timeout: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, stream.write_all(buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::new(ErrKind::TimedOut)),
    }
}

/// Best-effort shutdown of the write direction.
pub(crate) async fn shutdown_write<S>(stream: &mut S, timeout: Duration)
where
    S: AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(timeout, stream.shutdown()).await;
}

/// A TCP stream, possibly wrapped in TLS. The dial stack picks the arm per
/// connection, so the layers above read and write one type.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
