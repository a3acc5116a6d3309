//! Work-order tracking client with optimistic updates.

pub mod api;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod logging;
pub mod mutation;
