//! Composable interceptors around the dispatch stage.
//!
//! A chain is an ordered slice of middleware ending at a [`Dispatcher`].
//! The first middleware in the slice runs outermost: it sees the request
//! first and the results last. Each middleware receives a [`Next`] handle for
//! the rest of the chain and may call it any number of times, e.g. once per
//! retry round, or not at all when it rejects every target itself.

mod rate_limit;
mod retry;

pub use rate_limit::{RateLimitMiddleware, TokenBucket};
pub use retry::{
    Backoff, BackoffFn, RetryMiddleware, constant_backoff, exponential_backoff,
    exponential_backoff_with_jitter, linear_backoff,
};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::dispatch::Dispatcher;
use crate::message::Message;
use crate::result::SendingResults;
use crate::target::Target;

/// Trait for chain interceptors.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Process a request, delegating the admitted targets to `next`.
    ///
    /// An `Err` is a fault of the middleware itself and aborts the whole call.
    /// Per-target failures belong inside the returned results.
    async fn process(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
        next: Next<'_>,
    ) -> Result<SendingResults>;
}

/// Continuation over the remainder of a chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    dispatcher: &'a dyn Dispatcher,
}

impl<'a> Next<'a> {
    /// Build the head of a chain.
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], dispatcher: &'a dyn Dispatcher) -> Self {
        Self {
            middlewares,
            dispatcher,
        }
    }

    /// Run the rest of the chain for `targets`.
    pub async fn run(
        self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
    ) -> Result<SendingResults> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middlewares: rest,
                    dispatcher: self.dispatcher,
                };
                head.process(token, message, targets, next).await
            }
            None => self.dispatcher.dispatch(token, message, targets).await,
        }
    }
}
