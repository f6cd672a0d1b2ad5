//! Accept loop: bind, listen, accept, hand each connection to the pipeline
//! as an independent unit of concurrency. Holds no per-connection registry.

use crate::connection::{ClientTiming, ConnectionId};
use crate::doh::DohHandle;
use crate::policy::PolicyProvider;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Bind a listening socket with `SO_REUSEADDR` + `SO_REUSEPORT` set before
/// `listen()`, which tokio's `TcpListener::bind` doesn't expose directly.
fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(socket.into())
}

/// Run the accept loop until `shutdown` fires. Every accepted connection is
/// handed off to its own `tokio::spawn`ed pipeline task; the loop itself
/// never blocks on connection work.
pub async fn run(
    addr: SocketAddr,
    backlog: u32,
    doh: Arc<DohHandle>,
    policy: Arc<dyn PolicyProvider>,
    timing: ClientTiming,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = bind_listener(addr, backlog)?;
    info!(%addr, "listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let id = ConnectionId::new();
                        info!(connection = %id, %peer, "accepted");
                        let doh = doh.clone();
                        let policy = policy.clone();
                        tokio::spawn(crate::connection::run(id, stream, doh, policy, timing));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("listener received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}
