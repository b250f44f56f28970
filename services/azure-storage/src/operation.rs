use crate::constants::*;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use percent_encoding::percent_encode;
use pipesign_core::time::{format_http_date, DateTime};
use pipesign_core::{Error, Result};

/// A data-described operation: everything the pipeline needs to know to
/// build, sign, send and classify one request.
///
/// One descriptor type replaces a per-operation class hierarchy; higher
/// level clients describe their REST surface as descriptor values.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// HTTP method.
    pub method: Method,
    /// Resource path, starting with `/`.
    pub path: String,
    /// Query parameters, unencoded.
    pub query: Vec<(String, String)>,
    /// Extra headers beyond the ones the builder stamps.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
    /// Statuses that count as success.
    pub expected: Vec<StatusCode>,
    /// Whether the operation may target a read-only secondary endpoint.
    pub read_only: bool,
    /// Whether an ambiguous network failure is safe to replay.
    pub idempotent: bool,
    /// Per-operation whitelist of additionally retryable statuses.
    pub retryable_statuses: Vec<StatusCode>,
}

impl OperationDescriptor {
    /// Describe an operation with defaults derived from the method:
    /// GET/HEAD operations are read-only; GET/HEAD/PUT/DELETE are
    /// idempotent.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let read_only = method == Method::GET || method == Method::HEAD;
        let idempotent =
            read_only || method == Method::PUT || method == Method::DELETE;

        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            expected: vec![StatusCode::OK],
            read_only,
            idempotent,
            retryable_statuses: Vec::new(),
        }
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Replace the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Replace the expected success statuses.
    pub fn with_expected(mut self, expected: Vec<StatusCode>) -> Self {
        self.expected = expected;
        self
    }

    /// Whitelist additional retryable statuses for this operation.
    pub fn with_retryable_statuses(mut self, statuses: Vec<StatusCode>) -> Self {
        self.retryable_statuses = statuses;
        self
    }

    /// Mark a non-idempotent operation as safe to replay (for example when
    /// it carries a replay-safe precondition).
    pub fn replay_safe(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Pure transform from an [`OperationDescriptor`] into an unsent wire
/// request.
///
/// Performs no I/O; invoked once per try so the `x-ms-date` stamp stays
/// current. The user agent is injected configuration, not process-global
/// state.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    version: String,
    user_agent: Option<String>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    /// Create a builder targeting the default API version.
    pub fn new() -> Self {
        Self {
            version: AZURE_VERSION.to_string(),
            user_agent: None,
        }
    }

    /// Target another API version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Send a User-Agent header on every built request.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build an unsent request against the given endpoint.
    ///
    /// `include_version` is false for batch sub-requests: the envelope, not
    /// the sub-request, owns the `x-ms-version` header.
    pub fn build(
        &self,
        op: &OperationDescriptor,
        endpoint: &Uri,
        now: DateTime,
        include_version: bool,
    ) -> Result<Request<Bytes>> {
        if !op.path.starts_with('/') {
            return Err(Error::invalid_argument(format!(
                "resource path must start with '/', got {:?}",
                op.path
            )));
        }
        if op.expected.is_empty() {
            return Err(Error::invalid_argument(
                "operation must expect at least one success status",
            ));
        }
        let authority = endpoint.authority().ok_or_else(|| {
            Error::invalid_argument(format!("endpoint {endpoint} has no authority"))
        })?;

        let mut uri = format!(
            "{}://{}{}",
            endpoint.scheme_str().unwrap_or("https"),
            authority,
            op.path
        );
        for (i, (k, v)) in op.query.iter().enumerate() {
            if k.is_empty() {
                return Err(Error::invalid_argument("query parameter name is empty"));
            }
            uri.push(if i == 0 { '?' } else { '&' });
            uri.push_str(k);
            if !v.is_empty() {
                uri.push('=');
                uri.push_str(&percent_encode(v.as_bytes(), &AZURE_QUERY_ENCODE_SET).to_string());
            }
        }

        let mut builder = Request::builder().method(op.method.clone()).uri(uri);
        for (name, value) in op.headers.iter() {
            builder = builder.header(name, value);
        }
        builder = builder.header(X_MS_DATE, format_http_date(now));
        if include_version {
            builder = builder.header(X_MS_VERSION, self.version.as_str());
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.header(http::header::USER_AGENT, user_agent.as_str());
        }
        if !op.body.is_empty() {
            builder = builder.header(http::header::CONTENT_LENGTH, op.body.len());
        }

        Ok(builder.body(op.body.clone())?)
    }
}
