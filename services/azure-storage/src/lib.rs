//! Signed, retried and batched request pipeline for Azure Storage.
//!
//! The pipeline stages are composable on their own, but most callers only
//! need [`Client`]: describe an operation as an [`OperationDescriptor`],
//! hand it to [`Client::execute`], and the client builds, signs, sends and
//! retries the request for you.
//!
//! ```no_run
//! use http::{Method, StatusCode, Uri};
//! use pipesign_azure_storage::{Client, Credential, Endpoints, OperationDescriptor};
//! use pipesign_core::Context;
//!
//! # async fn example(ctx: Context) -> pipesign_core::Result<()> {
//! let credential = Credential::with_shared_key("account", "aGVsbG8gd29ybGQ=");
//! let endpoints = Endpoints::new(Uri::from_static("https://account.blob.core.windows.net"));
//! let client = Client::new(ctx, credential, endpoints);
//!
//! let op = OperationDescriptor::new(Method::GET, "/container/blob.txt");
//! let resp = client.execute(&op).await?;
//! assert_eq!(resp.status(), StatusCode::OK);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod constants;

mod account_sas;
pub use account_sas::AccountSharedAccessSignature;
mod batch;
pub use batch::{BatchOutcome, SubResponse};
mod client;
pub use client::{Client, Endpoints};
mod credential;
pub use credential::Credential;
mod operation;
pub use operation::{OperationDescriptor, RequestBuilder};
mod sas;
pub use sas::{ServiceSharedAccessSignature, SharedAccessPolicy};
mod sign;
pub use sign::{RequestSigner, SigningMethod};
