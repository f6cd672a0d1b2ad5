use thiserror::Error;

/// Error taxonomy for the per-connection pipeline.
///
/// Every variant is local to one connection: the pipeline boundary logs it
/// and tears the connection down. Nothing here ever propagates out of a
/// connection task.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unrecognized proxy protocol")]
    UnknownProxy,

    #[error("unsupported SOCKS5 command: {0:#04x}")]
    Socks5Unsupported(u8),

    #[error("unsupported SOCKS5 address type")]
    Socks5BadAddrType,

    #[error("HTTP CONNECT request missing Host header")]
    HttpMissingHost,

    #[error("malformed TLS ClientHello: {0}")]
    MalformedTls(&'static str),

    #[error("ClientHello did not negotiate TLS 1.3")]
    NotTls13,

    #[error("DoH lookup for {0} returned no matching answer")]
    DohNoAnswer(String),

    #[error("DoH endpoint returned HTTP {0}")]
    DohHttp(u16),

    #[error("DoH transport error: {0}")]
    DohTransport(String),

    #[error("failed to connect upstream: {0}")]
    ConnectFailed(#[source] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("benign close race (bad file descriptor)")]
    Benign,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// `true` for errors that are expected traffic, not failures worth a
    /// warning-level log line.
    pub fn is_benign(&self) -> bool {
        matches!(self, ProxyError::PeerClosed | ProxyError::Benign)
    }
}

/// Classify an I/O error arising from a copier racing a `close()` on the
/// opposite direction. Both sides close their sockets independently when
/// the pipeline tears down; the losing copier observes either a clean EOF
/// or an OS-level "bad file descriptor" / "not connected" error, neither of
/// which is an actual failure.
pub fn classify_io_error(err: std::io::Error) -> ProxyError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            ProxyError::PeerClosed
        }
        ErrorKind::NotConnected => ProxyError::Benign,
        _ if err.raw_os_error() == Some(libc_ebadf()) => ProxyError::Benign,
        _ => ProxyError::Io(err),
    }
}

#[cfg(unix)]
fn libc_ebadf() -> i32 {
    9 // EBADF
}

#[cfg(not(unix))]
fn libc_ebadf() -> i32 {
    -1
}
