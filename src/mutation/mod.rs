//! Optimistic mutations against cached collections.
//!
//! A mutation patches the visible value immediately, performs the remote
//! call, and then either confirms (invalidate + refetch from the server) or
//! rolls back to the snapshot it captured. Results come back as a
//! [`MutationOutcome`]; presenting failures is up to the caller.

mod executor;
mod pending;
mod reconciler;

pub use executor::{RemoteExecutor, RemoteFuture};
pub use pending::{MutationId, MutationState, RollbackContext};
pub use reconciler::{MutationOutcome, Reconciler, SameKeyPolicy};
