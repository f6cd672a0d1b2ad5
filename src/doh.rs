//! DNS-over-HTTPS resolution with a single-flight, sharded cache.
//!
//! The remote query is routed back through this proxy's own listener: we
//! dial our own loopback address and perform a genuine TLS handshake
//! against `cloudflare-dns.com`'s real certificate, so from the proxy's own
//! handshake engine's point of view this looks like any other raw-TLS
//! client. The short-circuit below is what keeps that self-dial from
//! looping forever.

use crate::error::ProxyError;
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock};
use tokio_rustls::TlsConnector;

const SHARD_COUNT: usize = 16;
const DOH_HOST: &str = "cloudflare-dns.com";

/// A resolved name, with the unix timestamp at which it must be treated as
/// stale.
#[derive(Debug, Clone)]
struct DohCacheEntry {
    ip: String,
    expires_at: i64,
}

/// The piece of `resolve` that actually leaves the process: one DNS-over-
/// HTTPS GET per query. Pulled behind a trait so the single-flight
/// coordination around it can be exercised with a fake transport instead of
/// a real TLS dial back into the proxy's own listener.
#[async_trait]
pub trait DohTransport: Send + Sync {
    async fn query(&self, name: &str, qtype: &str) -> Result<(String, i64), ProxyError>;
}

/// Real transport: dials `proxy_addr` (this proxy's own listener), performs
/// a genuine TLS 1.3 handshake against `cloudflare-dns.com`, and issues the
/// DoH GET over HTTP/1.1.
pub struct CloudflareDohTransport {
    proxy_addr: SocketAddr,
    tls_connector: TlsConnector,
}

impl CloudflareDohTransport {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            proxy_addr,
            tls_connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[async_trait]
impl DohTransport for CloudflareDohTransport {
    async fn query(&self, name: &str, qtype: &str) -> Result<(String, i64), ProxyError> {
        let tcp = TcpStream::connect(self.proxy_addr)
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let server_name = ServerName::try_from(DOH_HOST)
            .map_err(|_| ProxyError::DohTransport("invalid DoH server name".to_string()))?
            .to_owned();
        let tls_stream = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let io = TokioIo::new(tls_stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("DoH connection task ended: {err}");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/dns-query?name={name}&type={qtype}"))
            .header("Host", DOH_HOST)
            .header("Accept", "application/dns-json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::DohHttp(status.as_u16()));
        }

        let body = response
            .collect()
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?
            .to_bytes();

        let parsed: DohResponse =
            serde_json::from_slice(&body).map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let wanted_type = if qtype == "AAAA" { 28 } else { 1 };
        parsed
            .answer
            .into_iter()
            .find(|a| a.rtype == wanted_type)
            .map(|a| (a.data, a.ttl))
            .ok_or_else(|| ProxyError::DohNoAnswer(name.to_string()))
    }
}

/// Shared DoH resolver handle: one per process, passed by reference to
/// every connection pipeline.
pub struct DohHandle {
    transport: Arc<dyn DohTransport>,
    cache: Vec<RwLock<HashMap<String, DohCacheEntry>>>,
    in_flight: Vec<RwLock<HashMap<String, Arc<Notify>>>>,
}

enum Action {
    Wait(Arc<Notify>),
    Resolve(Arc<Notify>),
}

impl DohHandle {
    /// `proxy_addr` is this proxy's own listening address; DoH lookups
    /// dial back into it instead of reaching Cloudflare directly.
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self::with_transport(Arc::new(CloudflareDohTransport::new(proxy_addr)))
    }

    /// Build a handle around an arbitrary transport. Production code always
    /// goes through `new`; tests substitute a fake transport to exercise the
    /// single-flight coordination without a real network round trip.
    pub fn with_transport(transport: Arc<dyn DohTransport>) -> Self {
        Self {
            transport,
            cache: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            in_flight: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    /// Resolve `name` to an IP literal for the given query type (`"A"` or
    /// `"AAAA"`).
    pub async fn resolve(&self, name: &str, qtype: &str) -> Result<String, ProxyError> {
        let name = name.to_ascii_lowercase();
        if qtype == "A" && (name == "cloudflare-dns.com" || name == "one.one.one.one") {
            return Ok("104.16.249.249".to_string());
        }

        let key = format!("{name}/{qtype}");
        let shard = shard_index(&key);

        loop {
            if let Some(ip) = self.cache_get(shard, &key).await {
                return Ok(ip);
            }

            let action = {
                let mut inflight = self.in_flight[shard].write().await;
                match inflight.get(&key) {
                    Some(existing) => Action::Wait(existing.clone()),
                    None => {
                        let notify = Arc::new(Notify::new());
                        inflight.insert(key.clone(), notify.clone());
                        Action::Resolve(notify)
                    }
                }
            };

            match action {
                Action::Wait(notify) => {
                    notify.notified().await;
                    continue;
                }
                Action::Resolve(notify) => {
                    let result = self.transport.query(&name, qtype).await;
                    if let Ok((ip, ttl)) = &result {
                        self.cache_put(shard, &key, ip.clone(), *ttl).await;
                    }
                    self.in_flight[shard].write().await.remove(&key);
                    notify.notify_waiters();
                    return result.map(|(ip, _)| ip);
                }
            }
        }
    }

    async fn cache_get(&self, shard: usize, key: &str) -> Option<String> {
        {
            let guard = self.cache[shard].read().await;
            if let Some(entry) = guard.get(key) {
                if entry.expires_at > now_unix() {
                    return Some(entry.ip.clone());
                }
            } else {
                return None;
            }
        }
        self.cache[shard].write().await.remove(key);
        None
    }

    async fn cache_put(&self, shard: usize, key: &str, ip: String, ttl: i64) {
        let expires_at = now_unix() + ttl - 10;
        self.cache[shard]
            .write()
            .await
            .insert(key.to_string(), DohCacheEntry { ip, expires_at });
    }
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dummy_handle() -> DohHandle {
        DohHandle::new("127.0.0.1:1".parse().unwrap())
    }

    /// A fake transport that counts invocations and sleeps briefly to widen
    /// the window in which concurrent callers can race each other.
    struct CountingTransport {
        calls: AtomicUsize,
        ip: String,
        ttl: i64,
        delay: Duration,
    }

    #[async_trait]
    impl DohTransport for CountingTransport {
        async fn query(&self, _name: &str, _qtype: &str) -> Result<(String, i64), ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok((self.ip.clone(), self.ttl))
        }
    }

    #[tokio::test]
    async fn short_circuit_bypasses_network_and_cache() {
        let handle = dummy_handle();
        assert_eq!(
            handle.resolve("cloudflare-dns.com", "A").await.unwrap(),
            "104.16.249.249"
        );
        assert_eq!(
            handle.resolve("one.one.one.one", "A").await.unwrap(),
            "104.16.249.249"
        );
        // Short-circuit never touches the cache.
        let shard = shard_index("cloudflare-dns.com/A");
        assert!(handle.cache[shard].read().await.is_empty());
    }

    #[tokio::test]
    async fn cache_hit_avoids_expiry_until_ttl_elapses() {
        let handle = dummy_handle();
        let key = "bar.test/A";
        let shard = shard_index(key);
        handle
            .cache_put(shard, key, "203.0.113.9".to_string(), 3600)
            .await;
        assert_eq!(
            handle.cache_get(shard, key).await,
            Some("203.0.113.9".to_string())
        );
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_read() {
        let handle = dummy_handle();
        let key = "old.test/A";
        let shard = shard_index(key);
        {
            let mut guard = handle.cache[shard].write().await;
            guard.insert(
                key.to_string(),
                DohCacheEntry {
                    ip: "203.0.113.1".to_string(),
                    expires_at: now_unix() - 1,
                },
            );
        }
        assert_eq!(handle.cache_get(shard, key).await, None);
        assert!(!handle.cache[shard].read().await.contains_key(key));
    }

    #[tokio::test]
    async fn single_flight_issues_exactly_one_outbound_query() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            ip: "203.0.113.42".to_string(),
            ttl: 300,
            delay: Duration::from_millis(50),
        });
        let handle = Arc::new(DohHandle::with_transport(transport.clone()));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.resolve("bar.test", "A").await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "203.0.113.42");
        }

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let shard = shard_index("bar.test/A");
        assert_eq!(
            handle.cache_get(shard, "bar.test/A").await,
            Some("203.0.113.42".to_string())
        );
    }

    #[tokio::test]
    async fn cache_hit_within_ttl_never_calls_transport_again() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            ip: "203.0.113.99".to_string(),
            ttl: 300,
            delay: Duration::from_millis(1),
        });
        let handle = DohHandle::with_transport(transport.clone());

        assert_eq!(handle.resolve("baz.test", "A").await.unwrap(), "203.0.113.99");
        assert_eq!(handle.resolve("baz.test", "A").await.unwrap(), "203.0.113.99");
        assert_eq!(handle.resolve("baz.test", "A").await.unwrap(), "203.0.113.99");

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
