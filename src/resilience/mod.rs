//! Retry, backoff and mirror failover for calls to external services.
//!
//! Every network collaborator of the core (routing, live lookup, gazetteer,
//! map database, dataset downloads) goes through these helpers so failures
//! degrade into per-record errors instead of aborting a batch.

mod cache;
mod failover;
mod retry;

pub use cache::cached_download;
#[cfg(test)]
pub(crate) use cache::serve_body;
pub use failover::{with_failover, FailoverError};
pub use retry::{retry, RetryPolicy};
