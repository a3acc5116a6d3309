//! CMMS backend access: REST client, wire types and cache glue.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod error;
pub mod operation;
pub mod types;

pub use cache::ApiQueryKey;
pub use cached_client::CachedApiClient;
pub use client::ApiClient;
pub use error::RemoteError;
pub use operation::RemoteOperation;
pub use types::{Checkout, Part, Priority, TimeEntry, WorkOrder, WorkOrderStatus};
