//! PostgreSQL [`MultiDb`] backend: one master pool and any number of replica pools.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{debug, info, warn};

use crate::{DatabaseConfig, DbError, DbJwtKey, DbPassword, DbResult, DbUser, MultiDb, Transaction};
use crate::config::mask_url;

const USER_COLUMNS: &str = "id, email, name, created_at, updated_at";

/// Master/replica PostgreSQL cluster.
pub struct PgMultiDb {
    master: PgPool,
    replicas: Vec<PgPool>,
    next: AtomicUsize,
}

impl PgMultiDb {
    /// Connect to the master and every reachable replica.
    ///
    /// The master must be reachable. Unreachable replicas are logged and
    /// skipped; reads then go to the remaining nodes.
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        info!("Connecting to PostgreSQL master: {}", config.master_url_masked());
        let master = pool_options(config)
            .connect(&config.master_url)
            .await
            .map_err(|e| DbError::Connection(format!("PostgreSQL master: {}", e)))?;
        info!("Connected to PostgreSQL master");

        let mut replicas = Vec::with_capacity(config.replica_urls.len());
        for url in &config.replica_urls {
            match pool_options(config).connect(url).await {
                Ok(pool) => {
                    info!("Connected to PostgreSQL replica: {}", mask_url(url));
                    replicas.push(pool);
                }
                Err(e) => warn!(replica = %mask_url(url), error = %e, "Skipping unreachable replica"),
            }
        }

        Ok(Self::from_pools(master, replicas))
    }

    /// Build from already configured pools.
    pub fn from_pools(master: PgPool, replicas: Vec<PgPool>) -> Self {
        Self {
            master,
            replicas,
            next: AtomicUsize::new(0),
        }
    }

    /// Run database migrations against the master
    pub async fn migrate(&self) -> DbResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.master)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        info!("Migrations complete");
        Ok(())
    }

    async fn begin(pool: &PgPool, read_only: bool) -> DbResult<PgTx> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DbError::Unavailable(e.to_string()))?;
        if read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await?;
        }
        Ok(PgTx {
            tx: Some(tx),
            read_only,
        })
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
}

/// Replica indices to try, starting at `start` and wrapping around once.
fn replica_order(start: usize, len: usize) -> impl Iterator<Item = usize> {
    let modulus = len.max(1);
    (0..len).map(move |i| (start % modulus + i) % modulus)
}

#[async_trait]
impl MultiDb for PgMultiDb {
    async fn master_tx(&self) -> DbResult<Box<dyn Transaction>> {
        let tx = Self::begin(&self.master, false).await?;
        debug!("Begin master TX");
        Ok(Box::new(tx))
    }

    async fn replica_tx(&self) -> DbResult<Box<dyn Transaction>> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for idx in replica_order(start, self.replicas.len()) {
            match Self::begin(&self.replicas[idx], true).await {
                Ok(tx) => {
                    debug!(replica = idx, "Begin replica TX");
                    return Ok(Box::new(tx));
                }
                Err(e) => warn!(replica = idx, error = %e, "Replica TX failed"),
            }
        }
        let tx = Self::begin(&self.master, true).await?;
        debug!("Begin read-only TX on master");
        Ok(Box::new(tx))
    }

    async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.master).await?;
        Ok(())
    }
}

struct PgTx {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    read_only: bool,
}

impl PgTx {
    fn conn(&mut self) -> DbResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| DbError::Transaction("transaction already finished".to_string()))
    }

    fn writable(&mut self, op: &'static str) -> DbResult<&mut PgConnection> {
        if self.read_only {
            return Err(DbError::ReadOnly(op));
        }
        self.conn()
    }

    async fn names(&mut self, sql: &'static str, user_id: i32) -> DbResult<Vec<String>> {
        let conn = self.conn()?;
        let names = sqlx::query_scalar::<_, String>(sql)
            .bind(user_id)
            .fetch_all(conn)
            .await?;
        Ok(names)
    }

    /// Replace the rows of `link` for a user, upserting names into `table`.
    async fn link(
        &mut self,
        op: &'static str,
        table: &'static str,
        link: &'static str,
        column: &'static str,
        user_id: i32,
        names: &[String],
    ) -> DbResult<()> {
        let conn = self.writable(op)?;
        sqlx::query(&format!("DELETE FROM {} WHERE user_id = $1", link))
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        let upsert = format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
            table
        );
        let insert = format!("INSERT INTO {} (user_id, {}) VALUES ($1, $2)", link, column);
        let unique: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        for name in unique {
            let id: i32 = sqlx::query_scalar(&upsert)
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
            sqlx::query(&insert)
                .bind(user_id)
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(|e| DbError::from_query(e, op))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTx {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn insert_user(&mut self, email: &str, name: Option<&str>) -> DbResult<DbUser> {
        let conn = self.writable("insert_user")?;
        let sql = format!(
            "INSERT INTO users (email, name) VALUES ($1, $2) RETURNING {}",
            USER_COLUMNS
        );
        sqlx::query_as::<_, DbUser>(&sql)
            .bind(email)
            .bind(name.filter(|n| !n.is_empty()))
            .fetch_one(conn)
            .await
            .map_err(|e| DbError::from_query(e, "insert user"))
    }

    async fn find_user_by_email(&mut self, email: &str) -> DbResult<Option<DbUser>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS);
        let user = sqlx::query_as::<_, DbUser>(&sql)
            .bind(email)
            .fetch_optional(conn)
            .await?;
        Ok(user)
    }

    async fn find_user_by_name(&mut self, name: &str) -> DbResult<Option<DbUser>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM users WHERE name = $1", USER_COLUMNS);
        let user = sqlx::query_as::<_, DbUser>(&sql)
            .bind(name)
            .fetch_optional(conn)
            .await?;
        Ok(user)
    }

    async fn user_groups(&mut self, user_id: i32) -> DbResult<Vec<String>> {
        self.names(
            r#"
            SELECT g.name FROM groups g
            JOIN user_groups ug ON ug.group_id = g.id
            WHERE ug.user_id = $1
            ORDER BY g.name
            "#,
            user_id,
        )
        .await
    }

    async fn user_audiences(&mut self, user_id: i32) -> DbResult<Vec<String>> {
        self.names(
            r#"
            SELECT a.name FROM audiences a
            JOIN user_audiences ua ON ua.audience_id = a.id
            WHERE ua.user_id = $1
            ORDER BY a.name
            "#,
            user_id,
        )
        .await
    }

    async fn set_user_groups(&mut self, user_id: i32, groups: &[String]) -> DbResult<()> {
        self.link("set_user_groups", "groups", "user_groups", "group_id", user_id, groups)
            .await
    }

    async fn set_user_audiences(&mut self, user_id: i32, audiences: &[String]) -> DbResult<()> {
        self.link(
            "set_user_audiences",
            "audiences",
            "user_audiences",
            "audience_id",
            user_id,
            audiences,
        )
        .await
    }

    async fn find_password(&mut self, user_id: i32) -> DbResult<Option<DbPassword>> {
        let conn = self.conn()?;
        let password = sqlx::query_as::<_, DbPassword>(
            "SELECT user_id, salt, hash, created_at, updated_at FROM passwords WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(conn)
        .await?;
        Ok(password)
    }

    async fn upsert_password(&mut self, user_id: i32, salt: &[u8], hash: &[u8]) -> DbResult<()> {
        let conn = self.writable("upsert_password")?;
        sqlx::query(
            r#"
            INSERT INTO passwords (user_id, salt, hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET salt = EXCLUDED.salt, hash = EXCLUDED.hash, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(salt)
        .bind(hash)
        .execute(conn)
        .await
        .map_err(|e| DbError::from_query(e, "upsert password"))?;
        Ok(())
    }

    async fn insert_jwt_key(&mut self, public_key: &[u8]) -> DbResult<DbJwtKey> {
        let conn = self.writable("insert_jwt_key")?;
        let key = sqlx::query_as::<_, DbJwtKey>(
            "INSERT INTO jwt_keys (public_key) VALUES ($1) RETURNING id, public_key, created_at",
        )
        .bind(public_key)
        .fetch_one(conn)
        .await?;
        Ok(key)
    }

    async fn find_jwt_key(&mut self, id: i32) -> DbResult<Option<DbJwtKey>> {
        let conn = self.conn()?;
        let key = sqlx::query_as::<_, DbJwtKey>(
            "SELECT id, public_key, created_at FROM jwt_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(key)
    }

    async fn commit(&mut self) -> DbResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DbError::Transaction("transaction already finished".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))
    }

    async fn rollback(&mut self) -> DbResult<()> {
        match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| DbError::Transaction(e.to_string())),
            None => Ok(()),
        }
    }
}
