//! SOCKS5h CONNECT through a local proxy (RFC 1928, no authentication).
//!
//! The `h` matters: the target hostname is sent to the proxy verbatim with
//! ATYP=domainname, so no DNS query ever happens on this host. Useful to
//! tunnel tests through Tor or any local SOCKS proxy.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ErrKind, Error, Result};
use crate::netx;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAINNAME: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

fn proto_err(cause: &str) -> Error {
    Error::with_cause(ErrKind::Socks5h, cause)
}

/// Negotiate a CONNECT to `hostname:port` on an established proxy
/// connection. On success the stream is a transparent tunnel to the target.
pub(crate) async fn connect<S>(
    stream: &mut S,
    hostname: &str,
    port: u16,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if hostname.len() > 255 {
        return Err(proto_err("hostname longer than 255 bytes"));
    }

    // Greeting: one method, no authentication.
    netx::write_all(stream, &[VERSION, 1, METHOD_NO_AUTH], timeout).await?;
    let mut choice = [0u8; 2];
    netx::read_exact(stream, &mut choice, timeout).await?;
    if choice != [VERSION, METHOD_NO_AUTH] {
        return Err(proto_err("proxy refused no-auth method"));
    }

    // CONNECT with the literal hostname.
    let mut request = Vec::with_capacity(7 + hostname.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAINNAME]);
    request.push(hostname.len() as u8);
    request.extend_from_slice(hostname.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    netx::write_all(stream, &request, timeout).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT.
    let mut head = [0u8; 4];
    netx::read_exact(stream, &mut head, timeout).await?;
    if head[0] != VERSION {
        return Err(proto_err("unexpected reply version"));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(proto_err(&format!("proxy reply code {}", head[1])));
    }
    let bound_len = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16,
        ATYP_DOMAINNAME => {
            let mut len = [0u8; 1];
            netx::read_exact(stream, &mut len, timeout).await?;
            len[0] as usize
        }
        _ => return Err(proto_err("unexpected bound address type")),
    };
    let mut bound = vec![0u8; bound_len + 2];
    netx::read_exact(stream, &mut bound, timeout).await?;
    Ok(())
}
