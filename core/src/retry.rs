//! Retry state machine: timing, classification and failover rules.
//!
//! One logical operation moves through
//! `NotStarted -> Attempting -> {WaitingToRetry -> Attempting}* ->
//! {Succeeded | FailedTerminal}`. Exactly one transport send happens per
//! `Attempting` entry, and every suspension point observes cancellation.

use crate::{Context, Error, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use log::debug;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which backoff curve a retry policy follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicyKind {
    /// `delay = min(max_delay, base * 2^(try-1) * jitter)`.
    Exponential,
    /// `delay = min(max_delay, base)` on every retry.
    Fixed,
}

/// Bounds for the retry loop. Immutable once constructed and safe to share.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    kind: RetryPolicyKind,
    max_tries: u32,
    base_delay: Duration,
    max_delay: Duration,
    try_timeout: Duration,
    overall_deadline: Option<Duration>,
}

/// Default per-try timeout when the caller does not set one.
const DEFAULT_TRY_TIMEOUT: Duration = Duration::from_secs(30);

impl RetryOptions {
    /// Create retry options, validating the bounds.
    ///
    /// `max_tries` must be at least 1 and `max_delay` must not be smaller
    /// than `base_delay`; violations fail with an invalid argument error.
    pub fn new(
        kind: RetryPolicyKind,
        max_tries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self> {
        if max_tries < 1 {
            return Err(Error::invalid_argument("max_tries must be at least 1"));
        }
        if max_delay < base_delay {
            return Err(Error::invalid_argument(
                "max_delay must not be smaller than base_delay",
            ));
        }

        Ok(Self {
            kind,
            max_tries,
            base_delay,
            max_delay,
            try_timeout: DEFAULT_TRY_TIMEOUT,
            overall_deadline: None,
        })
    }

    /// Exponential backoff with the service defaults: 3 tries, 4s base
    /// delay, 120s cap.
    pub fn exponential() -> Self {
        Self {
            kind: RetryPolicyKind::Exponential,
            max_tries: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(120),
            try_timeout: DEFAULT_TRY_TIMEOUT,
            overall_deadline: None,
        }
    }

    /// Fixed backoff with the service defaults: 3 tries, 30s delay.
    pub fn fixed() -> Self {
        Self {
            kind: RetryPolicyKind::Fixed,
            max_tries: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            try_timeout: DEFAULT_TRY_TIMEOUT,
            overall_deadline: None,
        }
    }

    /// Set the per-try timeout.
    pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
        self.try_timeout = timeout;
        self
    }

    /// Set the overall deadline across all tries and waits.
    pub fn with_overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = Some(deadline);
        self
    }

    /// Maximum number of tries.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Compute the delay before the retry following `try_number`, with a
    /// freshly sampled jitter factor.
    fn delay_for(&self, try_number: u32) -> Duration {
        let jitter = match self.kind {
            RetryPolicyKind::Exponential => rand::thread_rng().gen_range(MIN_JITTER..=MAX_JITTER),
            RetryPolicyKind::Fixed => 1.0,
        };
        self.delay_with_jitter(try_number, jitter)
    }

    /// Pure delay computation, factored out so tests can pin the jitter.
    fn delay_with_jitter(&self, try_number: u32, jitter: f64) -> Duration {
        match self.kind {
            RetryPolicyKind::Exponential => {
                // The cap is applied while still in f64: large try numbers
                // overflow Duration long before the exponent saturates.
                let exp = 2f64.powi(try_number.saturating_sub(1).min(1023) as i32);
                let secs = (self.base_delay.as_secs_f64() * exp * jitter)
                    .min(self.max_delay.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
            RetryPolicyKind::Fixed => self.base_delay.min(self.max_delay),
        }
    }
}

const MIN_JITTER: f64 = 0.8;
const MAX_JITTER: f64 = 1.2;

/// Which endpoint a try targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The primary endpoint.
    Primary,
    /// The read-only secondary endpoint.
    Secondary,
}

/// What the request factory needs to know about the upcoming try.
#[derive(Debug, Clone, Copy)]
pub struct TryContext {
    /// 1-based try counter.
    pub try_number: u32,
    /// Endpoint this try targets.
    pub location: Location,
}

/// Per-invocation retry state. Created fresh for every logical operation and
/// never shared across concurrent calls.
#[derive(Debug)]
struct RetryState {
    try_number: u32,
    location: Location,
    started: Instant,
    // Whether the location schedule alternates onto the secondary endpoint.
    alternate: bool,
}

impl RetryState {
    fn new(alternate: bool) -> Self {
        Self {
            try_number: 1,
            location: Location::Primary,
            started: Instant::now(),
            alternate,
        }
    }

    fn try_context(&self) -> TryContext {
        TryContext {
            try_number: self.try_number,
            location: self.location,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to the next try. Even tries target the secondary when the
    /// schedule alternates; a failure on secondary thereby always falls back
    /// to primary on the next try.
    fn advance(&mut self) {
        self.try_number += 1;
        self.location = if self.alternate && self.try_number % 2 == 0 {
            Location::Secondary
        } else {
            Location::Primary
        };
    }
}

/// Behavioral traits of one operation, consumed by the retry loop.
#[derive(Debug, Clone, Copy)]
pub struct TryPlan {
    /// Read-only operations may target a secondary endpoint.
    pub read_only: bool,
    /// Whether an ambiguous network failure is safe to replay.
    pub idempotent: bool,
    /// Whether a secondary endpoint is configured at all.
    pub has_secondary: bool,
}

/// How a response status should steer the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Success,
    Retry,
    Fail,
}

/// Classifies response statuses for one operation.
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    expected: Vec<StatusCode>,
    retryable: Vec<StatusCode>,
}

impl ResponseClassifier {
    /// Create a classifier that treats `expected` statuses as success.
    pub fn new(expected: Vec<StatusCode>) -> Self {
        Self {
            expected,
            retryable: Vec::new(),
        }
    }

    /// Whitelist extra statuses as retryable for this operation.
    pub fn with_retryable(mut self, retryable: Vec<StatusCode>) -> Self {
        self.retryable = retryable;
        self
    }

    fn classify(&self, status: StatusCode, location: Location) -> Disposition {
        if self.expected.contains(&status) {
            return Disposition::Success;
        }
        if self.retryable.contains(&status) {
            return Disposition::Retry;
        }
        if status == StatusCode::REQUEST_TIMEOUT {
            return Disposition::Retry;
        }
        // A 404 from the secondary may just mean replication lag; retry
        // (the schedule falls back to primary next try).
        if status == StatusCode::NOT_FOUND && location == Location::Secondary {
            return Disposition::Retry;
        }
        // 501/505 are permanent protocol errors even though they are 5xx.
        if status == StatusCode::NOT_IMPLEMENTED || status == StatusCode::HTTP_VERSION_NOT_SUPPORTED
        {
            return Disposition::Fail;
        }
        if status.is_server_error() {
            return Disposition::Retry;
        }

        Disposition::Fail
    }
}

/// Drives one logical operation through repeated tries against the transport.
///
/// The request factory is invoked fresh for every try so time-sensitive
/// fields (signing timestamps, expiry windows) stay current. Factory errors
/// terminate immediately without consuming a try.
#[derive(Debug)]
pub struct RetryExecutor {
    options: RetryOptions,
    cancel: CancellationToken,
}

impl RetryExecutor {
    /// Create an executor over the given options.
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token. Cancellation pre-empts the loop at any
    /// suspension point and yields a cancellation error.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the retry loop to a terminal outcome.
    pub async fn run<F>(
        &self,
        ctx: &Context,
        plan: &TryPlan,
        classifier: &ResponseClassifier,
        mut build: F,
    ) -> Result<Response<Bytes>>
    where
        F: FnMut(&TryContext) -> Result<Request<Bytes>> + Send,
    {
        let mut state = RetryState::new(plan.read_only && plan.has_secondary);

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::cancelled("cancelled before attempt"));
            }

            let try_ctx = state.try_context();
            let req = build(&try_ctx)?;

            let Some(timeout) = self.try_timeout(&state) else {
                return Err(Error::transient_network(format!(
                    "overall deadline exhausted before try {}",
                    state.try_number
                )));
            };

            debug!(
                "try {}/{} against {:?} endpoint, timeout {:?}",
                state.try_number,
                self.options.max_tries,
                try_ctx.location,
                timeout
            );

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::cancelled("cancelled during send"));
                }
                r = ctx.http_send(req, timeout) => r,
            };

            let last_err = match outcome {
                Ok(resp) => match classifier.classify(resp.status(), try_ctx.location) {
                    Disposition::Success => return Ok(resp),
                    Disposition::Fail => {
                        return Err(Error::service(
                            resp.status(),
                            format!("terminal service response on try {}", state.try_number),
                        ));
                    }
                    Disposition::Retry => Error::service(
                        resp.status(),
                        format!("retryable service response on try {}", state.try_number),
                    ),
                },
                Err(e) => {
                    let err = Error::transient_network(format!(
                        "transport failure on try {}",
                        state.try_number
                    ))
                    .with_source(e);
                    if !plan.idempotent {
                        // The send may have taken effect; replay is not safe.
                        return Err(err);
                    }
                    err
                }
            };

            if state.try_number >= self.options.max_tries {
                return Err(last_err);
            }

            let delay = self.options.delay_for(state.try_number);
            if let Some(deadline) = self.options.overall_deadline {
                if state.elapsed() + delay >= deadline {
                    return Err(last_err);
                }
            }

            debug!(
                "waiting {:?} before try {} ({last_err})",
                delay,
                state.try_number + 1
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::cancelled("cancelled while waiting to retry"));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            state.advance();
        }
    }

    /// Per-try timeout: the configured try timeout clamped to whatever
    /// remains of the overall deadline. `None` once the deadline is spent.
    fn try_timeout(&self, state: &RetryState) -> Option<Duration> {
        match self.options.overall_deadline {
            None => Some(self.options.try_timeout),
            Some(deadline) => {
                let remaining = deadline.checked_sub(state.elapsed())?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.min(self.options.try_timeout))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpSend;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use test_case::test_case;

    #[test]
    fn test_options_reject_zero_tries() {
        let err = RetryOptions::new(
            RetryPolicyKind::Fixed,
            0,
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_options_reject_inverted_delay_bounds() {
        let err = RetryOptions::new(
            RetryPolicyKind::Exponential,
            3,
            Duration::from_millis(500),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test_case(1; "first try")]
    #[test_case(2; "second try")]
    #[test_case(3; "third try")]
    #[test_case(4; "fourth try")]
    #[test_case(5; "fifth try")]
    #[test_case(6; "sixth try")]
    fn test_exponential_delays_stay_within_cap(try_number: u32) {
        let options = RetryOptions::new(
            RetryPolicyKind::Exponential,
            6,
            Duration::from_millis(2),
            Duration::from_millis(8000),
        )
        .unwrap();

        for _ in 0..64 {
            let delay = options.delay_for(try_number);
            assert!(delay <= Duration::from_millis(8000), "delay {delay:?}");
        }
    }

    #[test]
    fn test_exponential_delay_doubles_under_fixed_jitter() {
        let options = RetryOptions::new(
            RetryPolicyKind::Exponential,
            6,
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(
            options.delay_with_jitter(1, 1.0),
            Duration::from_millis(100)
        );
        assert_eq!(
            options.delay_with_jitter(2, 1.0),
            Duration::from_millis(200)
        );
        assert_eq!(
            options.delay_with_jitter(3, 1.0),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_exponential_delay_saturates_at_cap_for_large_try_numbers() {
        let options = RetryOptions::new(
            RetryPolicyKind::Exponential,
            64,
            Duration::from_secs(4),
            Duration::from_secs(120),
        )
        .unwrap();

        // 4 * 2^62 seconds overflows Duration; the cap must win before the
        // conversion, not after.
        assert_eq!(
            options.delay_with_jitter(63, 1.0),
            Duration::from_secs(120)
        );
        assert_eq!(
            options.delay_with_jitter(u32::MAX, MAX_JITTER),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_fixed_delays_are_identical() {
        let options = RetryOptions::new(
            RetryPolicyKind::Fixed,
            5,
            Duration::from_millis(100),
            Duration::from_millis(2000),
        )
        .unwrap();

        let first = options.delay_for(1);
        assert_eq!(first, Duration::from_millis(100));
        for try_number in 2..=5 {
            assert_eq!(options.delay_for(try_number), first);
        }
    }

    #[test]
    fn test_classifier_rules() {
        let classifier = ResponseClassifier::new(vec![StatusCode::OK])
            .with_retryable(vec![StatusCode::CONFLICT]);

        let p = Location::Primary;
        assert_eq!(classifier.classify(StatusCode::OK, p), Disposition::Success);
        assert_eq!(
            classifier.classify(StatusCode::BAD_REQUEST, p),
            Disposition::Fail
        );
        assert_eq!(
            classifier.classify(StatusCode::UNAUTHORIZED, p),
            Disposition::Fail
        );
        assert_eq!(
            classifier.classify(StatusCode::REQUEST_TIMEOUT, p),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(StatusCode::SERVICE_UNAVAILABLE, p),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(StatusCode::NOT_IMPLEMENTED, p),
            Disposition::Fail
        );
        // per-operation whitelist
        assert_eq!(
            classifier.classify(StatusCode::CONFLICT, p),
            Disposition::Retry
        );
        // secondary may lag; primary 404 is terminal
        assert_eq!(
            classifier.classify(StatusCode::NOT_FOUND, Location::Secondary),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(StatusCode::NOT_FOUND, p),
            Disposition::Fail
        );
    }

    /// Transport returning a scripted sequence of outcomes, then repeating
    /// the last one.
    #[derive(Debug)]
    struct ScriptedTransport {
        script: Mutex<Vec<std::result::Result<StatusCode, String>>>,
        sends: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<std::result::Result<StatusCode, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                sends: AtomicU32::new(0),
            })
        }

        fn sends(&self) -> u32 {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct SharedTransport(Arc<ScriptedTransport>);

    #[async_trait::async_trait]
    impl HttpSend for SharedTransport {
        async fn http_send(
            &self,
            _: Request<Bytes>,
            _: Duration,
        ) -> anyhow::Result<Response<Bytes>> {
            self.0.sends.fetch_add(1, Ordering::SeqCst);
            let mut script = self.0.script.lock().unwrap();
            let outcome = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            match outcome {
                Ok(status) => Ok(http::Response::builder()
                    .status(status)
                    .body(Bytes::new())
                    .unwrap()),
                Err(msg) => Err(anyhow!(msg)),
            }
        }
    }

    fn test_request(_: &TryContext) -> Result<Request<Bytes>> {
        Ok(http::Request::get("https://account.queue.core.windows.net/myqueue")
            .body(Bytes::new())
            .unwrap())
    }

    fn fast_options(max_tries: u32) -> RetryOptions {
        RetryOptions::new(
            RetryPolicyKind::Fixed,
            max_tries,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    const IDEMPOTENT_PLAN: TryPlan = TryPlan {
        read_only: false,
        idempotent: true,
        has_secondary: false,
    };

    #[tokio::test(start_paused = true)]
    async fn test_permanent_transient_failure_consumes_exactly_max_tries() {
        let transport = ScriptedTransport::new(vec![Err("connection reset".to_string())]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let executor = RetryExecutor::new(fast_options(4));
        let err = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, test_request)
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 4);
        assert_eq!(err.kind(), crate::ErrorKind::TransientNetwork);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_halts_after_first_try() {
        let transport = ScriptedTransport::new(vec![Ok(StatusCode::BAD_REQUEST)]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let executor = RetryExecutor::new(fast_options(5));
        let err = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, test_request)
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 1);
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_statuses() {
        let transport = ScriptedTransport::new(vec![
            Ok(StatusCode::SERVICE_UNAVAILABLE),
            Ok(StatusCode::INTERNAL_SERVER_ERROR),
            Ok(StatusCode::OK),
        ]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let executor = RetryExecutor::new(fast_options(5));
        let resp = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, test_request)
            .await
            .unwrap();

        assert_eq!(transport.sends(), 3);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_network_failure_is_terminal() {
        let transport = ScriptedTransport::new(vec![Err("broken pipe".to_string())]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::CREATED]);

        let plan = TryPlan {
            read_only: false,
            idempotent: false,
            has_secondary: false,
        };
        let executor = RetryExecutor::new(fast_options(5));
        let err = executor
            .run(&ctx, &plan, &classifier, test_request)
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 1);
        assert_eq!(err.kind(), crate::ErrorKind::TransientNetwork);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_alternates_onto_secondary() {
        let transport = ScriptedTransport::new(vec![
            Ok(StatusCode::SERVICE_UNAVAILABLE),
            Ok(StatusCode::NOT_FOUND),
            Ok(StatusCode::OK),
        ]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let plan = TryPlan {
            read_only: true,
            idempotent: true,
            has_secondary: true,
        };
        let locations = Arc::new(Mutex::new(Vec::new()));
        let seen = locations.clone();

        let executor = RetryExecutor::new(fast_options(5));
        executor
            .run(&ctx, &plan, &classifier, move |try_ctx| {
                seen.lock().unwrap().push(try_ctx.location);
                test_request(try_ctx)
            })
            .await
            .unwrap();

        // try 2 hits the secondary; its 404 (replica lag) falls back to
        // primary on try 3 instead of failing.
        assert_eq!(
            *locations.lock().unwrap(),
            vec![Location::Primary, Location::Secondary, Location::Primary]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_preempts_without_consuming_a_try() {
        let transport = ScriptedTransport::new(vec![Ok(StatusCode::OK)]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = RetryExecutor::new(fast_options(3)).with_cancellation(cancel);
        let err = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, test_request)
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 0);
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_builder_error_terminates_before_any_send() {
        let transport = ScriptedTransport::new(vec![Ok(StatusCode::OK)]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        let executor = RetryExecutor::new(fast_options(3));
        let err = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, |_| {
                Err(Error::invalid_argument("empty resource path"))
            })
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 0);
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_stops_waiting() {
        let transport = ScriptedTransport::new(vec![Err("timed out".to_string())]);
        let ctx = Context::new().with_http_send(SharedTransport(transport.clone()));
        let classifier = ResponseClassifier::new(vec![StatusCode::OK]);

        // A 10s retry delay never fits in a 5ms overall window.
        let options = RetryOptions::new(
            RetryPolicyKind::Fixed,
            5,
            Duration::from_secs(10),
            Duration::from_secs(10),
        )
        .unwrap()
        .with_overall_deadline(Duration::from_millis(5));

        let executor = RetryExecutor::new(options);
        let err = executor
            .run(&ctx, &IDEMPOTENT_PLAN, &classifier, test_request)
            .await
            .unwrap_err();

        assert_eq!(transport.sends(), 1);
        assert_eq!(err.kind(), crate::ErrorKind::TransientNetwork);
    }
}
