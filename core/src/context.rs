use crate::clock::{Clock, SystemClock};
use crate::http::HttpSend;
use crate::time::DateTime;
use anyhow::anyhow;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Context provides the collaborators the pipeline needs to run.
///
/// The transport defaults to a no-op implementation that fails every send;
/// callers configure a real one with [`Context::with_http_send`]. The clock
/// defaults to the system clock.
///
/// Context is cheap to clone and safe to share across concurrent callers; it
/// holds no per-request state.
///
/// ## Example
///
/// ```no_run
/// use pipesign_core::Context;
///
/// let ctx = Context::new();
/// // ctx.with_http_send(my_transport)
/// //    .with_clock(my_clock);
/// ```
#[derive(Clone)]
pub struct Context {
    http: Arc<dyn HttpSend>,
    clock: Arc<dyn Clock>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("http", &self.http)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a new Context with the default collaborators.
    pub fn new() -> Self {
        Self {
            http: Arc::new(NoopHttpSend),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the transport implementation.
    pub fn with_http_send(mut self, http: impl HttpSend) -> Self {
        self.http = Arc::new(http);
        self
    }

    /// Replace the clock implementation.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Send an http request under the given per-try timeout.
    #[inline]
    pub async fn http_send(
        &self,
        req: http::Request<Bytes>,
        timeout: Duration,
    ) -> anyhow::Result<http::Response<Bytes>> {
        self.http.http_send(req, timeout).await
    }

    /// Take the current time from the configured clock.
    #[inline]
    pub fn now(&self) -> DateTime {
        self.clock.now()
    }
}

/// Transport that refuses every send. The default until one is configured.
#[derive(Debug)]
struct NoopHttpSend;

#[async_trait::async_trait]
impl HttpSend for NoopHttpSend {
    async fn http_send(
        &self,
        _: http::Request<Bytes>,
        _: Duration,
    ) -> anyhow::Result<http::Response<Bytes>> {
        Err(anyhow!(
            "no transport configured, call Context::with_http_send first"
        ))
    }
}
