//! Per-call unit of work
//!
//! A [`RequestTransaction`] owns one database transaction and a child of the
//! caller's [`CallContext`]. Writes go to the master, reads to any replica.
//! Every storage step runs under the call deadline; [`RequestTransaction::done`]
//! rolls back and cancels the context on every exit path, so a committed
//! transaction is simply rolled back as a no-op.

use std::time::Duration;

use futures::future::BoxFuture;
use tollgate_db::{DbError, DbResult, MultiDb, Transaction};
use tracing::{debug, error, warn};

use crate::context::CallContext;
use crate::error::{AuthError, AuthResult};

pub struct RequestTransaction {
    tx: Option<Box<dyn Transaction>>,
    ctx: CallContext,
    read_only: bool,
    method: &'static str,
    finished: bool,
}

impl RequestTransaction {
    /// Open a transaction for the RPC `method`.
    ///
    /// Read-only calls are served by any replica, writes by the master.
    pub async fn begin(
        db: &dyn MultiDb,
        ctx: &CallContext,
        method: &'static str,
        read_only: bool,
    ) -> AuthResult<Self> {
        if let Some(err) = ctx.err() {
            warn!(method, error = %err, "Context expired before begin");
            return Err(AuthError::StorageFailure(format!("context expired: {}", err)));
        }

        let ctx = ctx.child();
        let opened = if read_only {
            ctx.run(db.replica_tx()).await
        } else {
            ctx.run(db.master_tx()).await
        };
        let tx = match opened {
            Ok(Ok(tx)) => tx,
            Ok(Err(e)) => {
                error!(method, read_only, error = %e, "Begin transaction failed");
                return Err(AuthError::StorageFailure(e.to_string()));
            }
            Err(e) => {
                warn!(method, read_only, error = %e, "Begin transaction interrupted");
                return Err(AuthError::StorageFailure(e.to_string()));
            }
        };
        debug!(method, read_only, "Begin TX");

        Ok(Self {
            tx: Some(tx),
            ctx,
            read_only,
            method,
            finished: false,
        })
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fail unless at least `need` remains before the deadline.
    pub fn enough_time(&self, need: Duration) -> AuthResult<()> {
        // Canceled or expired, either way the call is out of time
        if self.ctx.err().is_some() {
            return Err(AuthError::DeadlineExceeded);
        }
        match self.ctx.remaining() {
            Some(left) if left < need => {
                warn!(method = self.method, ?left, ?need, "Not enough time in context");
                Err(AuthError::InsufficientBudget)
            }
            _ => Ok(()),
        }
    }

    /// Run one storage step under the call context.
    ///
    /// Storage errors are logged here with the method and step name.
    pub async fn run<'a, T, F>(&'a mut self, op: &'static str, f: F) -> AuthResult<T>
    where
        F: FnOnce(&'a mut (dyn Transaction + 'static)) -> BoxFuture<'a, DbResult<T>>,
    {
        let Self { tx, ctx, method, .. } = self;
        let method: &'static str = *method;
        let tx = tx
            .as_deref_mut()
            .ok_or_else(|| AuthError::Internal(format!("{}: transaction already finished", op)))?;

        match ctx.run(f(tx)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ DbError::Duplicate(_))) => {
                debug!(method, op, error = %e, "Duplicate row");
                Err(e.into())
            }
            Ok(Err(e)) => {
                error!(method, op, error = %e, "Storage operation failed");
                Err(e.into())
            }
            Err(e) => {
                warn!(method, op, error = %e, "Storage operation interrupted");
                Err(e)
            }
        }
    }

    /// Commit; any failure is a storage failure.
    pub async fn commit(&mut self) -> AuthResult<()> {
        let tx = self
            .tx
            .as_deref_mut()
            .ok_or_else(|| AuthError::Internal("commit: transaction already finished".to_string()))?;
        match self.ctx.run(tx.commit()).await {
            Ok(Ok(())) => {
                debug!(method = self.method, "Commit TX");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(method = self.method, error = %e, "Commit failed");
                Err(AuthError::StorageFailure(e.to_string()))
            }
            Err(e) => {
                error!(method = self.method, error = %e, "Commit interrupted");
                Err(AuthError::StorageFailure(e.to_string()))
            }
        }
    }

    /// Roll back and cancel the derived context. Always called, also after commit.
    pub async fn done(mut self) {
        self.finished = true;
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                error!(method = self.method, error = %e, "Rollback failed");
            }
        }
        self.ctx.cancel();
        debug!(method = self.method, "Done TX");
    }
}

impl Drop for RequestTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.cancel();
            error!(method = self.method, "Transaction dropped without done()");
        }
    }
}
