//! Error types for the proxy core.
//!
//! Every session-scoped failure funnels into [`ProxyError`]. The session loop
//! catches per-iteration, reports through the exception reporter, and tears
//! the exchange down; see the propagation notes on each variant.

use thiserror::Error;

/// Errors surfaced by the connection handler and session loop.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client stream closed mid-exchange. Exits quietly, never reported to hooks.
    #[error("client closed the connection mid-exchange")]
    ClientAborted,

    /// Outbound dial or upstream-proxy chaining failed. A synthetic 502 is
    /// written to the client only when no response bytes have been emitted.
    #[error("failed to reach upstream {host}:{port}: {source}")]
    UpstreamUnreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Start-line, header block, or chunk framing could not be parsed.
    /// Disposes both sides.
    #[error("malformed HTTP framing: {0}")]
    MalformedFraming(String),

    /// TLS handshake failed on either side. Silent close on the client side
    /// of CONNECT, logged on transparent endpoints.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// A user hook returned an error. Fatal for the exchange.
    #[error("hook failed: {0}")]
    HookFailure(anyhow::Error),

    /// Leaf certificate minting or TLS config assembly failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Body compression or decompression failed, or the encoding token is
    /// not one this proxy can read.
    #[error("codec error: {0}")]
    Codec(String),

    /// Composite session-scoped failure wrapping the inner cause.
    #[error("HTTP exchange failed: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for errors that end an exchange without being worth reporting.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::ClientAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_abort_is_quiet() {
        assert!(ProxyError::ClientAborted.is_quiet());
        assert!(!ProxyError::MalformedFraming("x".into()).is_quiet());
    }

    #[test]
    fn upstream_unreachable_carries_target() {
        let err = ProxyError::UpstreamUnreachable {
            host: "origin.test".into(),
            port: 443,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        let msg = err.to_string();
        assert!(msg.contains("origin.test:443"), "got: {}", msg);
    }
}
