//! Core components of the request pipeline.
//!
//! This crate provides the transport-agnostic half of a storage-style SDK
//! pipeline: the collaborator container, the error taxonomy, the signing
//! view over unsent requests, and the retry state machine that drives one
//! logical operation through repeated tries.
//!
//! ## Overview
//!
//! - **Context**: holds the [`HttpSend`] transport and [`Clock`]
//!   collaborators; immutable, cheap to clone, shared across callers.
//! - **SigningRequest**: a decomposed request view with the helpers
//!   canonical string construction needs.
//! - **RetryExecutor**: the `Attempting -> WaitingToRetry` loop with
//!   timing, classification, failover and cancellation rules.
//!
//! Service-specific signing (SAS tokens, shared-key authorization) and the
//! batch protocol live in service crates built on top of this one.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::StatusCode;
//! use pipesign_core::{
//!     Context, ResponseClassifier, RetryExecutor, RetryOptions, TryPlan,
//! };
//!
//! # async fn example() -> pipesign_core::Result<()> {
//! let ctx = Context::new(); // .with_http_send(...)
//!
//! let executor = RetryExecutor::new(RetryOptions::exponential());
//! let plan = TryPlan {
//!     read_only: true,
//!     idempotent: true,
//!     has_secondary: false,
//! };
//! let classifier = ResponseClassifier::new(vec![StatusCode::OK]);
//!
//! let resp = executor
//!     .run(&ctx, &plan, &classifier, |_try_ctx| {
//!         // rebuild and re-sign the request fresh for every try
//!         Ok(http::Request::get("https://account.blob.core.windows.net/c/b")
//!             .body(Bytes::new())?)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Make sure all our public APIs have docs.
#![warn(missing_docs)]

pub mod hash;
pub mod time;

mod clock;
pub use clock::{Clock, FixedClock, SystemClock};
mod context;
pub use context::Context;
mod error;
pub use error::{Error, ErrorKind, Result};
mod http;
pub use crate::http::HttpSend;
mod request;
pub use request::SigningRequest;
mod retry;
pub use retry::{
    Location, ResponseClassifier, RetryExecutor, RetryOptions, RetryPolicyKind, TryContext,
    TryPlan,
};
