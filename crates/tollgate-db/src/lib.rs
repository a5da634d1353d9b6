//! Tollgate Database Layer
//!
//! Multi-node persistence for the Tollgate identity provider. Callers never
//! see connections or pools, only transactions:
//!
//! - [`MultiDb::master_tx`] always runs on the master node and may write.
//! - [`MultiDb::replica_tx`] runs on any available replica and is read-only.
//!
//! # Backends
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     dyn MultiDb                          │
//! ├────────────────────────────┬─────────────────────────────┤
//! │  PgMultiDb                 │  MemoryDb                   │
//! │  master PgPool             │  committed snapshot         │
//! │  replica PgPools (RR)      │  serialized writers         │
//! │  sqlx migrations           │  availability switch        │
//! └────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! Every transaction must be finished with [`Transaction::commit`] or
//! [`Transaction::rollback`]. Rolling back an already committed transaction
//! is a no-op, so callers may always roll back on their way out.

pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

pub use config::DatabaseConfig;
pub use error::{DbError, DbResult};
pub use memory::MemoryDb;
pub use models::*;
pub use postgres::PgMultiDb;

/// Typed row operations available inside one database transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Whether this transaction was opened on a read-only node.
    fn is_read_only(&self) -> bool;

    // =========================================================================
    // Users
    // =========================================================================

    /// Insert a new user. Fails with [`DbError::Duplicate`] on a taken email or name.
    async fn insert_user(&mut self, email: &str, name: Option<&str>) -> DbResult<DbUser>;

    async fn find_user_by_email(&mut self, email: &str) -> DbResult<Option<DbUser>>;

    async fn find_user_by_name(&mut self, name: &str) -> DbResult<Option<DbUser>>;

    // =========================================================================
    // Memberships
    // =========================================================================

    /// Names of the groups the user is a member of, sorted.
    async fn user_groups(&mut self, user_id: i32) -> DbResult<Vec<String>>;

    /// Names of the audiences the user is entitled to, sorted.
    async fn user_audiences(&mut self, user_id: i32) -> DbResult<Vec<String>>;

    /// Replace the user's group memberships, creating missing groups.
    async fn set_user_groups(&mut self, user_id: i32, groups: &[String]) -> DbResult<()>;

    /// Replace the user's audience entitlements, creating missing audiences.
    async fn set_user_audiences(&mut self, user_id: i32, audiences: &[String]) -> DbResult<()>;

    // =========================================================================
    // Passwords
    // =========================================================================

    async fn find_password(&mut self, user_id: i32) -> DbResult<Option<DbPassword>>;

    /// Insert or overwrite the salted hash of a user.
    async fn upsert_password(&mut self, user_id: i32, salt: &[u8], hash: &[u8]) -> DbResult<()>;

    // =========================================================================
    // Signing keys
    // =========================================================================

    /// Persist a public key; storage assigns the id.
    async fn insert_jwt_key(&mut self, public_key: &[u8]) -> DbResult<DbJwtKey>;

    async fn find_jwt_key(&mut self, id: i32) -> DbResult<Option<DbJwtKey>>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn commit(&mut self) -> DbResult<()>;

    /// Discard the transaction. A no-op after a successful commit.
    async fn rollback(&mut self) -> DbResult<()>;
}

/// Handle on a master/replica database cluster.
#[async_trait]
pub trait MultiDb: Send + Sync {
    /// Begin a read-write transaction on the master node.
    async fn master_tx(&self) -> DbResult<Box<dyn Transaction>>;

    /// Begin a read-only transaction on any reachable replica.
    async fn replica_tx(&self) -> DbResult<Box<dyn Transaction>>;

    /// Cheap liveness probe of the master node.
    async fn health_check(&self) -> DbResult<()>;
}
