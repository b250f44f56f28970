use crate::batch::{frame_envelope, parse_envelope_response, BatchOutcome};
use crate::operation::{OperationDescriptor, RequestBuilder};
use crate::sign::{RequestSigner, SigningMethod};
use crate::Credential;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, StatusCode, Uri};
use log::debug;
use pipesign_core::{
    Context, Error, Location, ResponseClassifier, Result, RetryExecutor, RetryOptions, TryPlan,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The endpoints one account exposes.
#[derive(Debug, Clone)]
pub struct Endpoints {
    primary: Uri,
    secondary: Option<Uri>,
}

impl Endpoints {
    /// Endpoints with only a primary.
    pub fn new(primary: Uri) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    /// Add a read-only secondary endpoint for failover.
    pub fn with_secondary(mut self, secondary: Uri) -> Self {
        self.secondary = Some(secondary);
        self
    }

    fn for_location(&self, location: Location) -> &Uri {
        match location {
            Location::Primary => &self.primary,
            Location::Secondary => self.secondary.as_ref().unwrap_or(&self.primary),
        }
    }
}

/// The pipeline facade consumed by resource-specific clients.
///
/// Holds only immutable configuration; one `Client` serves any number of
/// concurrent invocations, each owning its own retry state.
#[derive(Debug)]
pub struct Client {
    ctx: Context,
    credential: Credential,
    endpoints: Endpoints,
    options: RetryOptions,
    builder: RequestBuilder,
    signer: RequestSigner,
}

impl Client {
    /// Create a client with the default retry options and request builder.
    pub fn new(ctx: Context, credential: Credential, endpoints: Endpoints) -> Self {
        Self {
            ctx,
            credential,
            endpoints,
            options: RetryOptions::exponential(),
            builder: RequestBuilder::new(),
            signer: RequestSigner::new(),
        }
    }

    /// Replace the default retry options.
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the request builder (API version, user agent).
    pub fn with_request_builder(mut self, builder: RequestBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Execute one operation under the client's retry options.
    pub async fn execute(&self, op: &OperationDescriptor) -> Result<Response<Bytes>> {
        self.execute_with(op, &self.options, CancellationToken::new())
            .await
    }

    /// Execute one operation with explicit retry options and cancellation.
    pub async fn execute_with(
        &self,
        op: &OperationDescriptor,
        options: &RetryOptions,
        cancel: CancellationToken,
    ) -> Result<Response<Bytes>> {
        if !self.credential.is_valid() {
            return Err(Error::authentication("credential is missing or expired"));
        }

        let plan = TryPlan {
            read_only: op.read_only,
            idempotent: op.idempotent,
            has_secondary: self.endpoints.secondary.is_some(),
        };
        let classifier = ResponseClassifier::new(op.expected.clone())
            .with_retryable(op.retryable_statuses.clone());
        let executor = RetryExecutor::new(options.clone()).with_cancellation(cancel);

        executor
            .run(&self.ctx, &plan, &classifier, |try_ctx| {
                // Rebuild and re-sign fresh every try so the date stamp and
                // signature stay current.
                let now = self.ctx.now();
                let endpoint = self.endpoints.for_location(try_ctx.location);
                let (mut parts, body) = self.builder.build(op, endpoint, now, true)?.into_parts();
                self.signer
                    .sign(&mut parts, &self.credential, now, SigningMethod::Header)?;
                Ok(Request::from_parts(parts, body))
            })
            .await
    }

    /// Build a presigned URL for one operation, valid for `expires_in`.
    pub fn presign(&self, op: &OperationDescriptor, expires_in: Duration) -> Result<Uri> {
        let now = self.ctx.now();
        let (mut parts, _) = self
            .builder
            .build(op, &self.endpoints.primary, now, false)?
            .into_parts();
        self.signer.sign(
            &mut parts,
            &self.credential,
            now,
            SigningMethod::Query(expires_in),
        )?;
        Ok(parts.uri)
    }

    /// Execute many operations as one batched wire exchange.
    pub async fn execute_batch(
        &self,
        items: Vec<(String, OperationDescriptor)>,
    ) -> Result<BatchOutcome> {
        self.execute_batch_with(items, &self.options, CancellationToken::new())
            .await
    }

    /// Execute a batch with explicit retry options and cancellation.
    ///
    /// Each item is built and signed in submission order and framed under
    /// its 0-based Content-ID. The envelope goes through the retry loop as
    /// one unit; transient failures retry the whole envelope, and a batch
    /// is never re-split because an individual item failed.
    pub async fn execute_batch_with(
        &self,
        items: Vec<(String, OperationDescriptor)>,
        options: &RetryOptions,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome> {
        if !self.credential.is_valid() {
            return Err(Error::authentication("credential is missing or expired"));
        }
        if items.is_empty() {
            return Err(Error::invalid_argument(
                "a batch needs at least one operation",
            ));
        }
        for (identity, op) in &items {
            if !op.body.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "batch item {identity:?} carries a body; only header-only operations batch"
                )));
            }
        }

        let boundary = format!("batch_{}", Uuid::new_v4());
        debug!("framing {} sub-requests under {boundary}", items.len());

        let plan = TryPlan {
            read_only: false,
            idempotent: items.iter().all(|(_, op)| op.idempotent),
            has_secondary: false,
        };
        let classifier = ResponseClassifier::new(vec![StatusCode::ACCEPTED]);
        let executor = RetryExecutor::new(options.clone()).with_cancellation(cancel);

        let resp = executor
            .run(&self.ctx, &plan, &classifier, |_| {
                let now = self.ctx.now();

                let mut subs = Vec::with_capacity(items.len());
                for (_, op) in &items {
                    // Sub-requests are signed without x-ms-version; the
                    // envelope owns that header.
                    let (mut parts, body) = self
                        .builder
                        .build(op, &self.endpoints.primary, now, false)?
                        .into_parts();
                    self.signer
                        .sign(&mut parts, &self.credential, now, SigningMethod::Header)?;
                    subs.push(Request::from_parts(parts, body));
                }
                let framed = frame_envelope(&boundary, &subs)?;

                let mut headers = http::HeaderMap::new();
                headers.insert(
                    CONTENT_TYPE,
                    format!("multipart/mixed; boundary={boundary}").parse()?,
                );
                let envelope = OperationDescriptor::new(Method::POST, "/")
                    .with_query("comp", "batch")
                    .with_headers(headers)
                    .with_body(Bytes::from(framed))
                    .with_expected(vec![StatusCode::ACCEPTED]);

                let (mut parts, body) = self
                    .builder
                    .build(&envelope, &self.endpoints.primary, now, true)?
                    .into_parts();
                self.signer
                    .sign(&mut parts, &self.credential, now, SigningMethod::Header)?;
                Ok(Request::from_parts(parts, body))
            })
            .await?;

        self.demux(items, resp)
    }

    /// Map demultiplexed parts back to caller identities, preserving
    /// submission order in both result maps.
    fn demux(
        &self,
        items: Vec<(String, OperationDescriptor)>,
        resp: Response<Bytes>,
    ) -> Result<BatchOutcome> {
        let mut parts = parse_envelope_response(&resp)?;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (idx, (identity, op)) in items.into_iter().enumerate() {
            let pos = parts.iter().position(|(id, _)| *id == idx).ok_or_else(|| {
                Error::unexpected(format!(
                    "batch response is missing a part for item {identity:?} (content-id {idx})"
                ))
            })?;
            let (_, sub) = parts.swap_remove(pos);

            if op.expected.contains(&sub.status) || sub.is_success() {
                succeeded.push((identity, sub));
            } else {
                failed.push((identity, sub));
            }
        }

        if failed.is_empty() {
            Ok(BatchOutcome::AllSucceeded(succeeded))
        } else {
            debug!(
                "batch finished with {} succeeded, {} failed",
                succeeded.len(),
                failed.len()
            );
            Ok(BatchOutcome::PartialFailure { succeeded, failed })
        }
    }
}
