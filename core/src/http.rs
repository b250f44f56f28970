use anyhow::Result;
use bytes::Bytes;
use std::fmt::Debug;
use std::time::Duration;

/// HttpSend is the transport collaborator of the pipeline.
///
/// One call corresponds to exactly one network try. Implementations own the
/// connection pool and must abort the exchange once `timeout` elapses; the
/// executor computes that value per try from the retry options and the
/// remaining overall deadline.
///
/// Errors returned here are treated as transient network failures by the
/// retry loop, so implementations should reserve them for reset/timeout/DNS
/// class problems and surface service responses as `http::Response` even for
/// non-2xx statuses.
#[async_trait::async_trait]
pub trait HttpSend: Debug + Send + Sync + 'static {
    /// Send an http request and return the response.
    async fn http_send(
        &self,
        req: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>>;
}
