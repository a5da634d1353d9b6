//! Out-of-band delivery of verification and reset links
//!
//! Delivery itself (mail, chat) lives outside this crate; the service only
//! hands a rendered link to a [`Notifier`].

use async_trait::async_trait;
use tracing::info;

use crate::error::AuthResult;

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Confirm a freshly registered address
    VerifyEmail,
    /// Let the user pick a new password
    ResetPassword,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `link` to `email`. The link embeds a bearer token.
    async fn notify(&self, kind: NotificationKind, email: &str, link: &str) -> AuthResult<()>;
}

/// Records notifications in the log without delivering them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, email: &str, _link: &str) -> AuthResult<()> {
        // The link carries a token and stays out of the log
        info!(?kind, email, "Notification queued");
        Ok(())
    }
}
