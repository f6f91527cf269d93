//! Interception hooks and data observers.
//!
//! Each lifecycle point holds an ordered list of async handlers invoked
//! sequentially with a mutable session view. A handler error is routed to
//! the exception reporter and aborts the exchange. Data observers are
//! synchronous per-chunk callbacks delivered in byte order per direction.

use crate::error::ProxyError;
use crate::session::{ConnectRequest, Session};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Direction of a relayed chunk, from the proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes sent toward the origin.
    Sent,
    /// Bytes received from the origin.
    Received,
}

/// Lifecycle hooks for intercepted exchanges. All methods default to no-ops;
/// implement the ones a deployment needs.
#[async_trait]
pub trait ExchangeHooks: Send + Sync {
    /// After a `CONNECT` command is parsed, before the tunnel is accepted.
    async fn tunnel_connect_request(&self, _connect: &mut ConnectRequest) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the tunnel is classified (`is_tls` known), and again on auth
    /// denial before the connection closes.
    async fn tunnel_connect_response(&self, _connect: &mut ConnectRequest) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before the request is sent upstream. May mutate headers, read or
    /// substitute the body, cancel the exchange, or override the upstream
    /// proxy.
    async fn before_request(&self, _session: &mut Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the response head is read, before anything is written to the
    /// client. May read or substitute the body or set re-request.
    async fn before_response(&self, _session: &mut Session) -> anyhow::Result<()> {
        Ok(())
    }
}

type DataObserver = dyn Fn(Direction, &[u8]) + Send + Sync;
type ExceptionReporter = dyn Fn(&ProxyError) + Send + Sync;

/// Ordered hook handlers plus observers, shared across all client tasks.
pub struct HookSet {
    handlers: Vec<Arc<dyn ExchangeHooks>>,
    observers: Vec<Arc<DataObserver>>,
    reporter: Arc<ExceptionReporter>,
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

impl HookSet {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            observers: Vec::new(),
            reporter: Arc::new(|error: &ProxyError| {
                warn!(error = %error, "exchange failed");
            }),
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ExchangeHooks>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn add_observer<F>(&mut self, observer: F) -> &mut Self
    where
        F: Fn(Direction, &[u8]) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Replace the default (tracing) exception reporter.
    pub fn set_reporter<F>(&mut self, reporter: F) -> &mut Self
    where
        F: Fn(&ProxyError) + Send + Sync + 'static,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    pub(crate) fn observe(&self, direction: Direction, chunk: &[u8]) {
        for observer in &self.observers {
            observer(direction, chunk);
        }
    }

    pub(crate) fn report(&self, error: &ProxyError) {
        if !error.is_quiet() {
            (self.reporter)(error);
        }
    }

    pub(crate) async fn tunnel_connect_request(
        &self,
        connect: &mut ConnectRequest,
    ) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .tunnel_connect_request(connect)
                .await
                .map_err(ProxyError::HookFailure)?;
        }
        Ok(())
    }

    pub(crate) async fn tunnel_connect_response(
        &self,
        connect: &mut ConnectRequest,
    ) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .tunnel_connect_response(connect)
                .await
                .map_err(ProxyError::HookFailure)?;
        }
        Ok(())
    }

    pub(crate) async fn before_request(&self, session: &mut Session) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .before_request(session)
                .await
                .map_err(ProxyError::HookFailure)?;
        }
        Ok(())
    }

    pub(crate) async fn before_response(&self, session: &mut Session) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .before_response(session)
                .await
                .map_err(ProxyError::HookFailure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, HttpVersion, Request};
    use crate::stream::FramedStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExchangeHooks for Counting {
        async fn before_request(&self, _session: &mut Session) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ExchangeHooks for Failing {
        async fn before_request(&self, _session: &mut Session) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("handler exploded"))
        }
    }

    fn dummy_session() -> Session {
        let (_, rx) = tokio::io::duplex(64);
        let request = Request::new(
            "GET".into(),
            "/".into(),
            Url::parse("http://h.test/").unwrap(),
            HttpVersion::HTTP_11,
            Headers::new(),
        );
        Session::new(request, FramedStream::new(Box::new(rx), 512))
    }

    #[tokio::test]
    async fn handlers_run_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookSet::new();
        hooks.add_handler(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }));
        hooks.add_handler(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }));

        let mut session = dummy_session();
        hooks.before_request(&mut session).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_failure_aborts_and_maps_to_hook_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookSet::new();
        hooks.add_handler(Arc::new(Failing));
        hooks.add_handler(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }));

        let mut session = dummy_session();
        let err = hooks.before_request(&mut session).await.unwrap_err();
        assert!(matches!(err, ProxyError::HookFailure(_)));
        // later handlers do not run
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observers_see_chunks_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks = HookSet::new();
        let sink = Arc::clone(&seen);
        hooks.add_observer(move |dir, chunk: &[u8]| {
            sink.lock().unwrap().push((dir, chunk.to_vec()));
        });

        hooks.observe(Direction::Sent, b"abc");
        hooks.observe(Direction::Received, b"def");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Direction::Sent, b"abc".to_vec()));
        assert_eq!(seen[1], (Direction::Received, b"def".to_vec()));
    }

    #[test]
    fn quiet_errors_are_not_reported() {
        let reported = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookSet::new();
        let counter = Arc::clone(&reported);
        hooks.set_reporter(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hooks.report(&ProxyError::ClientAborted);
        assert_eq!(reported.load(Ordering::SeqCst), 0);

        hooks.report(&ProxyError::MalformedFraming("x".into()));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }
}
