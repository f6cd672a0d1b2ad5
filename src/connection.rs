//! Per-connection pipeline: handshake, parse, resolve, connect, fragment,
//! splice. One instance owns exactly one accepted client socket end to end.

use crate::doh::DohHandle;
use crate::error::{classify_io_error, ProxyError};
use crate::fragment::{send_fragmented, TlsFragmentJob};
use crate::handshake::{self, ProxyProtocol};
use crate::policy::{IpFamily, Policy, PolicyProvider};
use crate::tls::parse_client_hello;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SPLICE_BUF_SIZE: usize = 16 * 1024;
const DEFAULT_TLS_PORT: u16 = 443;

/// Stable opaque id for a single accepted connection, used to correlate
/// its log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long to wait for the upstream TCP connect to complete.
#[derive(Debug, Clone, Copy)]
pub struct ClientTiming {
    pub connect_timeout: Duration,
}

impl Default for ClientTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
        }
    }
}

/// Drive one accepted client socket through the full pipeline. Never
/// returns an error to the caller: every `ProxyError` is local to this
/// connection, logged here, and swallowed.
pub async fn run(
    id: ConnectionId,
    client: TcpStream,
    doh: Arc<DohHandle>,
    policy: Arc<dyn PolicyProvider>,
    timing: ClientTiming,
) {
    if let Err(err) = run_inner(id, client, &doh, policy.as_ref(), timing).await {
        if err.is_benign() {
            debug!(connection = %id, "{err}");
        } else {
            warn!(connection = %id, "{err}");
        }
    }
}

async fn run_inner(
    id: ConnectionId,
    mut client: TcpStream,
    doh: &DohHandle,
    policy: &dyn PolicyProvider,
    timing: ClientTiming,
) -> Result<(), ProxyError> {
    // 1. Proxy handshake.
    let outcome = handshake::run(&mut client).await?;
    debug!(connection = %id, protocol = ?outcome.protocol, "handshake complete");

    // 2. First-record read. The `None` path already consumed the leading
    // 0x16; the other two paths have consumed nothing of the TLS stream
    // yet. Either way the caller ends up with a genuine 5-byte record
    // header followed by the declared number of handshake bytes.
    let record_header = read_record_header(&mut client, outcome.protocol).await?;
    if record_header[0] != 0x16 {
        return Err(ProxyError::MalformedTls("expected a TLS handshake record"));
    }
    let record_len = u16::from_be_bytes([record_header[3], record_header[4]]) as usize;
    let mut handshake_bytes = vec![0u8; record_len];
    client
        .read_exact(&mut handshake_bytes)
        .await
        .map_err(classify_io_error)?;

    // 3. ClientHello parse.
    let hello = parse_client_hello(&handshake_bytes)?;
    if !hello.is_tls13 {
        return Err(ProxyError::NotTls13);
    }
    let sni = std::str::from_utf8(hello.sni(&handshake_bytes))
        .map_err(|_| ProxyError::MalformedTls("SNI is not valid UTF-8"))?
        .to_string();

    let mut remote_host = outcome.remote.map(|(host, _)| host);
    let mut remote_port = outcome.remote.map(|(_, port)| port);
    if remote_host.as_deref().map(is_ip_literal).unwrap_or(true) {
        remote_host = Some(sni.clone());
        remote_port = Some(DEFAULT_TLS_PORT);
    }
    let remote_host = remote_host.unwrap_or(sni);
    let remote_port = remote_port.unwrap_or(DEFAULT_TLS_PORT);

    // 4. Policy lookup.
    let effective = policy.get_policy(&remote_host);

    // 5. DNS resolution.
    let ip = resolve_ip(doh, &remote_host, &effective).await?;
    let port = effective.port.unwrap_or(remote_port);

    // 6. Connect upstream.
    let upstream_addr = std::net::SocketAddr::new(ip, port);
    let mut upstream = tokio::time::timeout(
        timing.connect_timeout,
        TcpStream::connect(upstream_addr),
    )
    .await
    .map_err(|_| {
        ProxyError::ConnectFailed(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        ))
    })?
    .map_err(ProxyError::ConnectFailed)?;
    upstream
        .set_nodelay(true)
        .map_err(ProxyError::ConnectFailed)?;
    info!(connection = %id, host = %remote_host, %upstream_addr, "connected upstream");

    // 7. Send fragmented ClientHello.
    let record_prefix = [record_header[0], record_header[1], record_header[2]];
    let job = TlsFragmentJob::new(&handshake_bytes, hello.sni_range.clone(), record_prefix);
    let chunks = job.build();
    send_fragmented(&mut upstream, &chunks)
        .await
        .map_err(classify_io_error)?;

    // 8. Splice.
    splice(client, upstream).await
}

/// Read the 5-byte TLS record header, reusing the detection byte already
/// consumed when the client spoke raw TLS.
async fn read_record_header(
    client: &mut TcpStream,
    protocol: ProxyProtocol,
) -> Result<[u8; 5], ProxyError> {
    let mut header = [0u8; 5];
    if protocol == ProxyProtocol::None {
        header[0] = 0x16;
        client
            .read_exact(&mut header[1..])
            .await
            .map_err(classify_io_error)?;
    } else {
        client
            .read_exact(&mut header)
            .await
            .map_err(classify_io_error)?;
    }
    Ok(header)
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

async fn resolve_ip(
    doh: &DohHandle,
    host: &str,
    policy: &Policy,
) -> Result<IpAddr, ProxyError> {
    if let Some(ip) = policy.ip {
        return Ok(ip);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let qtype = match policy.ip_type {
        Some(IpFamily::V6) => "AAAA",
        _ => "A",
    };
    let ip = doh.resolve(host, qtype).await?;
    ip.parse()
        .map_err(|_| ProxyError::DohNoAnswer(host.to_string()))
}

/// Bidirectional byte copy with coupled shutdown: closing either socket
/// ends both directions. The downstream (upstream→client) copier runs as
/// its own task; the upstream (client→upstream) copier runs in the
/// current task, so both directions make progress independently.
async fn splice(client: TcpStream, upstream: TcpStream) -> Result<(), ProxyError> {
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let downstream = tokio::spawn(async move {
        let result = copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    });

    let upstream_result = copy(&mut client_read, &mut upstream_write).await;
    let _ = upstream_write.shutdown().await;

    let downstream_result = downstream.await.unwrap_or(Ok(()));
    downstream_result.or(upstream_result)
}

async fn copy<R, W>(reader: &mut R, writer: &mut W) -> Result<(), ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(classify_io_error(e)),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return Err(classify_io_error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literal_detection() {
        assert!(is_ip_literal("93.184.216.34"));
        assert!(is_ip_literal("::1"));
        assert!(!is_ip_literal("example.com"));
    }

    #[tokio::test]
    async fn resolve_ip_prefers_policy_override() {
        let doh = DohHandle::new("127.0.0.1:1".parse().unwrap());
        let policy = Policy {
            ip: Some("203.0.113.7".parse().unwrap()),
            port: Some(8443),
            ip_type: Some(IpFamily::V4),
        };
        let ip = resolve_ip(&doh, "foo.test", &policy).await.unwrap();
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn resolve_ip_short_circuits_ip_literal_host() {
        let doh = DohHandle::new("127.0.0.1:1".parse().unwrap());
        let ip = resolve_ip(&doh, "93.184.216.34", &Policy::default())
            .await
            .unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }
}
