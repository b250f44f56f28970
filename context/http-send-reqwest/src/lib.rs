//! Reqwest-based transport implementation for the pipeline.
//!
//! This crate provides [`ReqwestHttpSend`], the production `HttpSend`
//! implementation backed by `reqwest::Client`. The client owns the
//! connection pool; the pipeline only asks for one exchange per try and
//! bounds it with the per-try timeout it computed.
//!
//! ## Example
//!
//! ```no_run
//! use pipesign_core::Context;
//! use pipesign_http_send_reqwest::ReqwestHttpSend;
//!
//! let ctx = Context::new().with_http_send(ReqwestHttpSend::default());
//! ```

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use pipesign_core::HttpSend;
use reqwest::{Client, Request};
use std::time::Duration;

/// `HttpSend` implementation over a shared `reqwest::Client`.
#[derive(Debug, Default)]
pub struct ReqwestHttpSend {
    client: Client,
}

impl ReqwestHttpSend {
    /// Create a new ReqwestHttpSend with a reqwest::Client.
    ///
    /// Pass a pre-configured client to control pooling, proxies or TLS;
    /// per-try timeouts are applied here and need no client configuration.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSend for ReqwestHttpSend {
    async fn http_send(
        &self,
        req: http::Request<Bytes>,
        timeout: Duration,
    ) -> anyhow::Result<http::Response<Bytes>> {
        let req = Request::try_from(req)?;

        // Dropping the execute future on timeout releases the pooled
        // connection.
        let resp = tokio::time::timeout(timeout, self.client.execute(req))
            .await
            .context("try timed out")??;
        let resp: http::Response<_> = resp.into();

        let (parts, body) = resp.into_parts();
        let bs = BodyExt::collect(body).await.map(|buf| buf.to_bytes())?;
        Ok(http::Response::from_parts(parts, bs))
    }
}
