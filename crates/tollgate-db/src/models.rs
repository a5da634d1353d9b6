//! Row types shared by every [`MultiDb`](crate::MultiDb) backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DbUser {
    pub id: i32,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Salted password hash, one-to-one with a user
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DbPassword {
    pub user_id: i32,
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted public half of a token signing keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DbJwtKey {
    pub id: i32,
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
