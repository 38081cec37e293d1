//! Request-scoped execution context.
//!
//! Every public engine and service method takes a `RequestContext`. Store calls
//! are raced against the context's cancellation token and deadline, so a
//! cancelled request drops its in-flight I/O instead of leaking it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AccessError, AccessResult};

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::now_v7(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context that gives up once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::new()
        }
    }

    /// Context bound to an externally owned cancellation token (e.g. the
    /// transport's per-connection token).
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::new()
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the request is cancelled or its
    /// deadline passes first. The losing future is dropped.
    pub async fn run<F>(&self, fut: F) -> AccessResult<F::Output>
    where
        F: Future,
    {
        if self.cancel.is_cancelled() {
            return Err(AccessError::Cancelled);
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(request_id = %self.request_id, "request cancelled during store call");
                Err(AccessError::Cancelled)
            }
            _ = deadline => {
                tracing::warn!(request_id = %self.request_id, "request deadline exceeded during store call");
                Err(AccessError::DeadlineExceeded)
            }
            out = fut => Ok(out),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
