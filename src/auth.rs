//! Pluggable proxy authorisation.
//!
//! The core only gates on the returned boolean. On denial the authorizer
//! itself writes a complete challenge response (`407` for explicit proxy
//! requests) to the client; on acceptance it writes nothing. The 401
//! challenger drives origin auth round trips when windows auth is enabled.

use crate::message::Request;
use crate::session::Session;
use crate::stream::{BoxedStream, FramedStream};
use async_trait::async_trait;

/// Gate for explicit proxy requests (`CONNECT` and plain absolute-URL).
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Return `true` to accept. On denial, write the full challenge
    /// response (e.g. `407 Proxy Authentication Required`) to `client`
    /// before returning `false`.
    async fn authorize(
        &self,
        request: &Request,
        client: &mut FramedStream<BoxedStream>,
    ) -> anyhow::Result<bool>;
}

/// Accepts every request. The default.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _request: &Request,
        _client: &mut FramedStream<BoxedStream>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Handles origin `401 Unauthorized` responses when windows auth is enabled,
/// e.g. by replaying the (pre-buffered) request with credentials.
#[async_trait]
pub trait AuthChallenger: Send + Sync {
    /// Return `true` when the session was disposed and the loop must exit;
    /// `false` lets the 401 stream through to the client.
    async fn handle_unauthorized(&self, session: &mut Session) -> anyhow::Result<bool>;
}

/// Never intervenes; 401 responses stream through untouched.
pub struct NoChallenge;

#[async_trait]
impl AuthChallenger for NoChallenge {
    async fn handle_unauthorized(&self, _session: &mut Session) -> anyhow::Result<bool> {
        Ok(false)
    }
}
