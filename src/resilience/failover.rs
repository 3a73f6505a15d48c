//! Multi-endpoint failover for services with several known mirrors.

use std::future::Future;
use thiserror::Error;
use tracing::{info, warn};

use super::{retry, RetryPolicy};

#[derive(Error, Debug)]
pub enum FailoverError<E: std::fmt::Display> {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("all {attempted} endpoints failed, last error: {last}")]
    Exhausted { attempted: usize, last: E },
}

impl<E: std::fmt::Display> FailoverError<E> {
    pub fn into_last(self) -> Option<E> {
        match self {
            FailoverError::NoEndpoints => None,
            FailoverError::Exhausted { last, .. } => Some(last),
        }
    }
}

/// Try each endpoint in order, spending the per-endpoint retry budget on
/// each before moving to the next mirror.
pub async fn with_failover<T, E, F, Fut>(
    endpoints: &[String],
    per_endpoint: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool + Copy,
    mut op: F,
) -> Result<T, FailoverError<E>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for (i, endpoint) in endpoints.iter().enumerate() {
        let result = retry(per_endpoint, label, is_transient, || op(endpoint.clone())).await;
        match result {
            Ok(value) => {
                if i > 0 {
                    info!("{} succeeded on fallback endpoint {}", label, endpoint);
                }
                return Ok(value);
            }
            Err(e) => {
                warn!("{} failed on endpoint {}: {}", label, endpoint, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(last) => Err(FailoverError::Exhausted {
            attempted: endpoints.len(),
            last,
        }),
        None => Err(FailoverError::NoEndpoints),
    }
}
