//! Outbound connection factory and idle pool.
//!
//! Connections are identified by the full tuple `(host, port, version,
//! is_tls, upstream proxy, bind endpoint)`; a handle is lent exclusively to
//! one session, returned to the pool on clean completion, and destroyed on
//! any error or identity mismatch. Chaining through an upstream HTTP proxy
//! uses a `CONNECT` handshake with optional Basic credentials.

use crate::config::{ProxyConfig, UpstreamProxy};
use crate::error::ProxyError;
use crate::message::HttpVersion;
use crate::stream::{BoxedStream, FramedStream, PrefixedStream};
use base64::{engine::general_purpose, Engine as _};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Identity of an outbound connection; pooling and reuse key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
    pub is_tls: bool,
    pub upstream_proxy: Option<String>,
    pub bind_endpoint: Option<SocketAddr>,
}

/// What the session loop wants to talk to.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
    pub is_tls: bool,
    /// Raw passthrough for a blind-spliced tunnel: never TLS-wrapped by us.
    pub is_for_connect: bool,
    /// Hook-selected upstream proxy; overrides the configured default.
    pub upstream_override: Option<UpstreamProxy>,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, version: HttpVersion, is_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            version,
            is_tls,
            is_for_connect: false,
            upstream_override: None,
        }
    }

    /// Raw tunnel target for a blind splice.
    pub fn raw(host: impl Into<String>, port: u16, version: HttpVersion) -> Self {
        Self {
            host: host.into(),
            port,
            version,
            is_tls: false,
            is_for_connect: true,
            upstream_override: None,
        }
    }
}

/// An outbound connection lent to exactly one session at a time.
pub struct OutboundConnection {
    identity: ConnectionIdentity,
    framed: FramedStream<BoxedStream>,
    via_proxy_plain: bool,
    created_at: Instant,
    last_used: Instant,
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("identity", &self.identity)
            .field("via_proxy_plain", &self.via_proxy_plain)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .finish()
    }
}

impl OutboundConnection {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn framed_mut(&mut self) -> &mut FramedStream<BoxedStream> {
        &mut self.framed
    }

    pub fn into_framed(self) -> FramedStream<BoxedStream> {
        self.framed
    }

    /// True when requests must use absolute-form targets (plain HTTP
    /// relayed through an upstream proxy).
    pub fn uses_absolute_form(&self) -> bool {
        self.via_proxy_plain
    }

    fn is_expired(&self, config: &FactoryConfig) -> bool {
        self.created_at.elapsed() > config.max_lifetime
            || self.last_used.elapsed() > config.idle_timeout
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub max_idle_per_identity: usize,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub connect_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_idle_per_identity: 8,
            idle_timeout: Duration::from_secs(90),
            max_lifetime: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FactoryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Process-wide factory for pooled outbound connections.
pub struct ConnectionFactory {
    pools: Mutex<HashMap<ConnectionIdentity, VecDeque<OutboundConnection>>>,
    stats: Mutex<FactoryStats>,
    tls: Arc<ClientConfig>,
    config: FactoryConfig,
    default_http_proxy: Option<UpstreamProxy>,
    default_https_proxy: Option<UpstreamProxy>,
    bind_endpoint: Option<SocketAddr>,
}

impl ConnectionFactory {
    pub fn new(proxy_config: &ProxyConfig, tls: Arc<ClientConfig>) -> Self {
        Self::with_factory_config(proxy_config, tls, FactoryConfig::default())
    }

    pub fn with_factory_config(
        proxy_config: &ProxyConfig,
        tls: Arc<ClientConfig>,
        config: FactoryConfig,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            stats: Mutex::new(FactoryStats::default()),
            tls,
            config,
            default_http_proxy: proxy_config.upstream_http_proxy.clone(),
            default_https_proxy: proxy_config.upstream_https_proxy.clone(),
            bind_endpoint: proxy_config.upstream_bind_endpoint,
        }
    }

    /// Resolve the identity a target would be pooled under.
    pub fn identity_for(&self, target: &ConnectionTarget) -> ConnectionIdentity {
        let proxy = self.select_proxy(target);
        ConnectionIdentity {
            host: target.host.clone(),
            port: target.port,
            version: target.version,
            is_tls: target.is_tls || target.is_for_connect,
            upstream_proxy: proxy.map(|p| p.id.clone()),
            bind_endpoint: self.bind_endpoint,
        }
    }

    fn select_proxy(&self, target: &ConnectionTarget) -> Option<UpstreamProxy> {
        if let Some(proxy) = &target.upstream_override {
            return Some(proxy.clone());
        }
        if target.is_tls || target.is_for_connect {
            self.default_https_proxy.clone()
        } else {
            self.default_http_proxy.clone()
        }
    }

    /// Take a pooled connection or dial a new one.
    pub async fn acquire(
        &self,
        target: &ConnectionTarget,
        buffer_size: usize,
    ) -> Result<OutboundConnection, ProxyError> {
        let identity = self.identity_for(target);

        {
            let mut pools = self.pools.lock().await;
            let mut stats = self.stats.lock().await;
            if let Some(pool) = pools.get_mut(&identity) {
                while let Some(mut conn) = pool.pop_front() {
                    if conn.is_expired(&self.config) {
                        stats.evictions += 1;
                        continue;
                    }
                    conn.last_used = Instant::now();
                    stats.hits += 1;
                    debug!(host = %identity.host, port = identity.port, "reusing pooled outbound connection");
                    return Ok(conn);
                }
            }
            stats.misses += 1;
        }

        self.dial(target, identity, buffer_size).await
    }

    /// Return a connection to the pool, or drop it when not reusable.
    pub async fn release(&self, conn: OutboundConnection, reusable: bool) {
        if !reusable || conn.is_expired(&self.config) || conn.framed.available() > 0 {
            debug!(host = %conn.identity.host, "dropping outbound connection");
            return;
        }
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(conn.identity.clone()).or_default();
        if pool.len() >= self.config.max_idle_per_identity {
            debug!(host = %conn.identity.host, "pool full, dropping outbound connection");
            return;
        }
        pool.push_back(conn);
    }

    pub async fn stats(&self) -> FactoryStats {
        self.stats.lock().await.clone()
    }

    /// Drop expired idle connections across all identities.
    pub async fn cleanup(&self) {
        let mut pools = self.pools.lock().await;
        let mut stats = self.stats.lock().await;
        for pool in pools.values_mut() {
            let before = pool.len();
            pool.retain(|conn| !conn.is_expired(&self.config));
            stats.evictions += (before - pool.len()) as u64;
        }
        pools.retain(|_, pool| !pool.is_empty());
    }

    async fn dial(
        &self,
        target: &ConnectionTarget,
        identity: ConnectionIdentity,
        buffer_size: usize,
    ) -> Result<OutboundConnection, ProxyError> {
        let proxy = self.select_proxy(target);
        let (dial_host, dial_port) = match &proxy {
            Some(p) => (p.host.clone(), p.port),
            None => (target.host.clone(), target.port),
        };

        let unreachable = |source: std::io::Error| ProxyError::UpstreamUnreachable {
            host: target.host.clone(),
            port: target.port,
            source,
        };

        let addr = lookup_host((dial_host.as_str(), dial_port))
            .await
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| {
                unreachable(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no address resolved",
                ))
            })?;

        let connect = self.connect_tcp(addr);
        let tcp = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                unreachable(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(unreachable)?;

        debug!(
            host = %target.host,
            port = target.port,
            via_proxy = proxy.is_some(),
            is_tls = target.is_tls,
            "outbound connection established"
        );

        // tunnel through the upstream proxy for TLS targets and raw tunnels
        let needs_connect_chain = proxy.is_some() && (target.is_tls || target.is_for_connect);
        let (stream, leftover) = if needs_connect_chain {
            let proxy = proxy.as_ref().unwrap();
            self.connect_through_proxy(tcp, proxy, &target.host, target.port, target.version)
                .await?
        } else {
            (tcp, Vec::new())
        };

        let boxed: BoxedStream = if target.is_tls && !target.is_for_connect {
            let name = ServerName::try_from(target.host.clone()).map_err(|e| {
                ProxyError::TlsHandshakeFailed(format!("invalid server name {}: {}", target.host, e))
            })?;
            let connector = TlsConnector::from(Arc::clone(&self.tls));
            let tls_stream = connector
                .connect(name, PrefixedStream::new(stream, leftover))
                .await
                .map_err(|e| {
                    warn!(host = %target.host, error = %e, "upstream TLS handshake failed");
                    ProxyError::TlsHandshakeFailed(e.to_string())
                })?;
            Box::new(tls_stream)
        } else {
            Box::new(PrefixedStream::new(stream, leftover))
        };

        let now = Instant::now();
        Ok(OutboundConnection {
            identity,
            framed: FramedStream::new(boxed, buffer_size),
            via_proxy_plain: proxy.is_some() && !target.is_tls && !target.is_for_connect,
            created_at: now,
            last_used: now,
        })
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        match self.bind_endpoint {
            Some(bind) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(bind)?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        }
    }

    /// `CONNECT` handshake through an upstream proxy. Returns the stream and
    /// any bytes the proxy sent past its header block.
    async fn connect_through_proxy(
        &self,
        tcp: TcpStream,
        proxy: &UpstreamProxy,
        host: &str,
        port: u16,
        version: HttpVersion,
    ) -> Result<(TcpStream, Vec<u8>), ProxyError> {
        let mut framed = FramedStream::new(tcp, 4096);

        let mut request = format!("CONNECT {}:{} {}\r\nHost: {}:{}\r\n", host, port, version, host, port);
        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            let credentials =
                general_purpose::STANDARD.encode(format!("{}:{}", username, password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
        }
        request.push_str("\r\n");
        framed.write_all(request.as_bytes()).await?;
        framed.flush().await?;

        let status_line = framed.read_line().await?;
        let accepted = status_line
            .split_whitespace()
            .nth(1)
            .map(|code| code == "200")
            .unwrap_or(false);
        // drain the proxy's header block regardless of outcome
        loop {
            if framed.read_line().await?.is_empty() {
                break;
            }
        }
        if !accepted {
            warn!(proxy = %proxy.id, status = %status_line, "upstream proxy refused CONNECT");
            return Err(ProxyError::UpstreamUnreachable {
                host: host.to_string(),
                port,
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("upstream proxy refused CONNECT: {}", status_line),
                ),
            });
        }

        let (tcp, leftover) = framed.into_parts();
        Ok((tcp, leftover))
    }
}

/// Synthetic gateway error written to the client when the factory could not
/// reach the origin and no response bytes have been emitted yet.
pub async fn write_bad_gateway<W>(w: &mut W, version: HttpVersion, detail: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let body = format!("Failed to reach upstream: {}\n", detail);
    let head = format!(
        "{} 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        version,
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body.as_bytes()).await?;
    w.flush().await
}
