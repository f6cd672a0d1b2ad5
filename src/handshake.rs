//! Proxy-protocol detection and handshake: HTTP CONNECT, SOCKS5, or raw
//! TLS with no framing at all.

use crate::error::{classify_io_error, ProxyError};
use std::net::Ipv6Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Which front-end framing the client used to reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Unknown,
    /// First byte was `0x16`: the client is speaking TLS directly.
    None,
    Http,
    Socks5,
}

/// Outcome of the handshake: the tentative remote address extracted from
/// the proxy framing (HTTP/SOCKS5), or `None` when the client spoke raw
/// TLS and the remote host must come from the ClientHello's SNI instead.
///
/// When `protocol` is `ProxyProtocol::None`, the detection byte `0x16` has
/// already been consumed from the stream and must be treated as the first
/// byte of the upcoming TLS record header by the caller.
pub struct HandshakeOutcome {
    pub protocol: ProxyProtocol,
    pub remote: Option<(String, u16)>,
}

/// Run the detect+handshake state machine over `stream`.
pub async fn run<S>(stream: &mut S) -> Result<HandshakeOutcome, ProxyError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut first = [0u8; 1];
    stream
        .read_exact(&mut first)
        .await
        .map_err(classify_io_error)?;

    match first[0] {
        0x05 => socks5_handshake(stream).await.map(|remote| HandshakeOutcome {
            protocol: ProxyProtocol::Socks5,
            remote: Some(remote),
        }),
        b'C' => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.map_err(classify_io_error)?;
            if &rest != b"ONNECT" {
                return Err(ProxyError::UnknownProxy);
            }
            http_connect_handshake(stream)
                .await
                .map(|remote| HandshakeOutcome {
                    protocol: ProxyProtocol::Http,
                    remote: Some(remote),
                })
        }
        0x16 => Ok(HandshakeOutcome {
            protocol: ProxyProtocol::None,
            remote: None,
        }),
        _ => Err(ProxyError::UnknownProxy),
    }
}

// ---- HTTP CONNECT -----------------------------------------------------

async fn http_connect_handshake<S>(stream: &mut S) -> Result<(String, u16), ProxyError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let headers = read_http_headers(stream).await?;

    let host_line = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("host:"));

    let remote = match host_line.and_then(|l| l.splitn(2, ':').nth(1)).map(str::trim) {
        Some(hostport) => parse_host_port(hostport),
        None => None,
    };

    match remote {
        Some((host, port)) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\nProxy-agent: MyProxy/1.0\r\n\r\n")
                .await
                .map_err(classify_io_error)?;
            Ok((host, port))
        }
        None => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nProxy-agent: MyProxy/1.0\r\n\r\n")
                .await;
            Err(ProxyError::HttpMissingHost)
        }
    }
}

/// Parse `host:port`, tolerating a missing port (defaults applied by the
/// caller via the pipeline's §4.F policy step, not here — this function
/// only reports what the header literally said).
fn parse_host_port(hostport: &str) -> Option<(String, u16)> {
    let (host, port) = hostport.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Read CRLF-terminated header lines up to the blank line that ends them.
async fn read_http_headers<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(classify_io_error)?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(ProxyError::HttpMissingHost);
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ---- SOCKS5 (RFC 1928) -------------------------------------------------

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

async fn socks5_handshake<S>(stream: &mut S) -> Result<(String, u16), ProxyError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    // Method selection: nmethods + method bytes, discarded — we only
    // support "no authentication".
    let mut nmethods = [0u8; 1];
    stream
        .read_exact(&mut nmethods)
        .await
        .map_err(classify_io_error)?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await.map_err(classify_io_error)?;
    stream
        .write_all(&[SOCKS5_VERSION, 0x00])
        .await
        .map_err(classify_io_error)?;

    // Request header: version, command, reserved.
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await.map_err(classify_io_error)?;
    let cmd = header[1];
    if cmd != SOCKS5_CMD_CONNECT {
        send_reply(stream, 0x07).await?; // command not supported
        return Err(ProxyError::Socks5Unsupported(cmd));
    }

    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await.map_err(classify_io_error)?;

    let remote = match atyp[0] {
        SOCKS5_ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(classify_io_error)?;
            let port = read_port(stream).await?;
            Some((
                format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3]),
                port,
            ))
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(classify_io_error)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await.map_err(classify_io_error)?;
            let port = read_port(stream).await?;
            Some((String::from_utf8_lossy(&name).into_owned(), port))
        }
        SOCKS5_ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await.map_err(classify_io_error)?;
            let port = read_port(stream).await?;
            Some((Ipv6Addr::from(addr).to_string(), port))
        }
        _ => None,
    };

    let Some(remote) = remote else {
        send_reply(stream, 0x08).await?; // address type not supported
        return Err(ProxyError::Socks5BadAddrType);
    };

    stream
        .write_all(&[
            SOCKS5_VERSION,
            0x00,
            0x00,
            0x01,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ])
        .await
        .map_err(classify_io_error)?;

    Ok(remote)
}

async fn read_port<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<u16, ProxyError> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.map_err(classify_io_error)?;
    Ok(u16::from_be_bytes(buf))
}

async fn send_reply<S: AsyncWriteExt + Unpin>(stream: &mut S, code: u8) -> Result<(), ProxyError> {
    stream
        .write_all(&[
            SOCKS5_VERSION,
            code,
            0x00,
            0x01,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ])
        .await
        .map_err(classify_io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn detects_raw_tls() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x16]).await.unwrap();
        let outcome = run(&mut server).await.unwrap();
        assert_eq!(outcome.protocol, ProxyProtocol::None);
        assert!(outcome.remote.is_none());
    }

    #[tokio::test]
    async fn detects_unknown_first_byte() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x00]).await.unwrap();
        drop(client);
        let result = run(&mut server).await;
        assert!(matches!(result, Err(ProxyError::UnknownProxy)));
    }

    #[tokio::test]
    async fn http_connect_happy_path() {
        let (mut client, mut server) = duplex(256);
        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        client.write_all(request).await.unwrap();

        let server_task = tokio::spawn(async move { run(&mut server).await });

        let mut resp = vec![0u8; 256];
        let n = client.read(&mut resp).await.unwrap();
        resp.truncate(n);
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 200"));

        let outcome = server_task.await.unwrap().unwrap();
        assert_eq!(outcome.protocol, ProxyProtocol::Http);
        assert_eq!(outcome.remote, Some(("example.com".to_string(), 443)));
    }

    #[tokio::test]
    async fn http_connect_missing_host_is_rejected() {
        let (mut client, mut server) = duplex(256);
        let request = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        client.write_all(request).await.unwrap();

        let server_task = tokio::spawn(async move { run(&mut server).await });

        let mut resp = vec![0u8; 256];
        let n = client.read(&mut resp).await.unwrap();
        resp.truncate(n);
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 400"));

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::HttpMissingHost)));
    }

    #[tokio::test]
    async fn socks5_domain_connect_happy_path() {
        let (mut client, mut server) = duplex(256);
        let mut req = vec![0x05, 0x01, 0x00]; // version, 1 method, no-auth
        client.write_all(&req).await.unwrap();
        req.clear();
        req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let server_task = tokio::spawn(async move { run(&mut server).await });

        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[0..2], [0x05, 0x00]);

        let outcome = server_task.await.unwrap().unwrap();
        assert_eq!(outcome.protocol, ProxyProtocol::Socks5);
        assert_eq!(outcome.remote, Some(("example.com".to_string(), 443)));
    }

    #[tokio::test]
    async fn socks5_ipv4_connect() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&[93, 184, 216, 34]);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let server_task = tokio::spawn(async move { run(&mut server).await });

        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();

        let outcome = server_task.await.unwrap().unwrap();
        assert_eq!(outcome.remote, Some(("93.184.216.34".to_string(), 443)));
    }

    #[tokio::test]
    async fn socks5_rejects_bind_command() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&[0x05, 0x02, 0x00]).await.unwrap(); // BIND
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();

        let result = run(&mut server).await;
        assert!(matches!(result, Err(ProxyError::Socks5Unsupported(0x02))));
    }
}
