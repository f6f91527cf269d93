//! Interpose - HTTP/HTTPS intercepting proxy core
//!
//! Interpose turns an accepted TCP connection into a sequence of intercepted
//! request/response exchanges. It terminates TLS with dynamically minted
//! leaf certificates, presents each exchange to user hooks, forwards it over
//! a pooled outbound connection (optionally via an upstream proxy), and
//! streams the response back.
//!
//! ## Features
//!
//! - **Explicit proxying**: `CONNECT` tunnels and absolute-URL requests
//! - **Transparent proxying**: SNI-driven TLS termination for NAT-redirected
//!   traffic
//! - **Selective decryption**: include/exclude regexes per endpoint; excluded
//!   or non-TLS tunnels are blind-spliced byte for byte
//! - **Hooks**: async `tunnel-connect-request/-response`, `before-request`,
//!   `before-response` handlers plus per-chunk data observers
//! - **HTTP/1.x fidelity**: keep-alive, chunked bodies, `Expect:
//!   100-continue`, `Upgrade: websocket`
//! - **Connection pooling**: outbound reuse keyed on the full connection
//!   identity, including upstream proxy and bind endpoint
//!
//! ## Usage
//!
//! The embedding application owns the listener and spawns one task per
//! accepted client:
//!
//! ```rust,no_run
//! use interpose::{handle_client, Endpoint, ExplicitEndpoint, ProxyConfig, ProxyContext};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(ProxyContext::new(ProxyConfig::default())?);
//!     let endpoint = Endpoint::Explicit(Arc::new(ExplicitEndpoint::new()));
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let ctx = Arc::clone(&ctx);
//!         let endpoint = endpoint.clone();
//!         tokio::spawn(async move {
//!             let _ = handle_client(stream, ctx, endpoint).await;
//!         });
//!     }
//! }
//! ```

// Framing and message model
pub mod body;
pub mod message;
pub mod stream;

// Connection handling core
pub mod relay;
pub mod session;
pub mod session_loop;
pub mod transparent;
pub mod tunnel;

// Collaborators
pub mod auth;
pub mod buffer;
pub mod cert;
pub mod codec;
pub mod factory;
pub mod hooks;
pub mod tls;

// Ambient
pub mod config;
pub mod error;

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use auth::{AllowAll, AuthChallenger, Authorizer, NoChallenge};
pub use buffer::BufferPool;
pub use cert::{server_config_from_pem, CertificateStore};
pub use config::{
    Endpoint, ExplicitEndpoint, ProxyConfig, TlsProtocols, TransparentEndpoint, UpstreamProxy,
};
pub use error::ProxyError;
pub use factory::{ConnectionFactory, ConnectionTarget, FactoryConfig};
pub use hooks::{Direction, ExchangeHooks, HookSet};
pub use message::{BodyMode, Headers, HttpVersion, Request, Response};
pub use session::{ConnectRequest, Session};
pub use session_loop::LoopMode;
pub use stream::{BoxedStream, FramedStream};
pub use tls::{ClientHelloInfo, ServerHelloInfo};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Process-wide services shared by every client task.
///
/// The certificate store and connection factory are safe for concurrent
/// access; per-session state never crosses tasks.
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub certs: Arc<CertificateStore>,
    pub factory: Arc<ConnectionFactory>,
    pub hooks: Arc<HookSet>,
    pub authorizer: Arc<dyn Authorizer>,
    pub challenger: Arc<dyn AuthChallenger>,
    pub buffers: Arc<BufferPool>,
}

impl ProxyContext {
    /// Assemble a context with default collaborators: a fresh CA, a pool
    /// trusting the webpki roots, no hooks, allow-all authorisation.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let upstream_tls = tls::upstream_client_config(config.supported_tls_protocols, &[])?;
        Self::with_upstream_tls(config, upstream_tls)
    }

    /// Assemble a context with a caller-provided upstream TLS client config
    /// (extra trust roots, client certificates).
    pub fn with_upstream_tls(
        config: ProxyConfig,
        upstream_tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self, ProxyError> {
        let certs = Arc::new(CertificateStore::new(config.supported_tls_protocols)?);
        let factory = Arc::new(ConnectionFactory::new(&config, upstream_tls));
        let buffers = BufferPool::new(config.buffer_size);
        Ok(Self {
            config,
            certs,
            factory,
            hooks: Arc::new(HookSet::new()),
            authorizer: Arc::new(AllowAll),
            challenger: Arc::new(NoChallenge),
            buffers,
        })
    }
}

/// Entry point for one accepted client connection.
///
/// The caller (accept loop) spawns one task per client; this call runs until
/// the client's whole intercepted lifetime is over.
pub async fn handle_client<S>(
    stream: S,
    ctx: Arc<ProxyContext>,
    endpoint: Endpoint,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match endpoint {
        Endpoint::Explicit(settings) => tunnel::handle_explicit(stream, ctx, settings).await,
        Endpoint::Transparent(settings) => {
            transparent::handle_transparent(stream, ctx, settings).await
        }
    }
}
