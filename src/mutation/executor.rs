use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use crate::api::RemoteError;

/// A boxed future for one remote call
pub type RemoteFuture = Pin<Box<dyn Future<Output = Result<(), RemoteError>> + Send>>;

/// Performs the side-effecting remote calls behind optimistic mutations.
///
/// Any error counts as "request failed"; the reconciler never retries.
pub trait RemoteExecutor: Send + Sync + 'static {
  /// Description of a call (endpoint + payload)
  type Operation: Display + Send + 'static;

  fn execute(&self, operation: Self::Operation) -> RemoteFuture;
}
