//! Deadline-bearing call context
//!
//! Every multi-step operation takes a [`CallContext`]. It carries an optional
//! deadline and a cancellation token; child contexts inherit both and are
//! canceled together with their parent.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, AuthResult};

/// Cancellation and deadline scope of one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl CallContext {
    /// A context without deadline that is never canceled by a parent.
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// A fresh context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that expires at `deadline` or the parent's deadline,
    /// whichever comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    /// Derive a child sharing the deadline; canceling it leaves the parent intact.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is no longer usable, if it is not.
    pub fn err(&self) -> Option<AuthError> {
        if self.token.is_cancelled() {
            return Some(AuthError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(AuthError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` until it completes, the context is canceled or the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> AuthResult<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AuthError::Canceled),
            _ = expiry => Err(AuthError::DeadlineExceeded),
            value = fut => Ok(value),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
