//! In-process [`MultiDb`] backend.
//!
//! Readers get an immutable snapshot of the last committed state. Writers are
//! serialized by an async mutex, work on a private copy and publish it on
//! commit, which gives every transaction a consistent view without any
//! locking on the read path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{DbError, DbJwtKey, DbPassword, DbResult, DbUser, MultiDb, Transaction};

#[derive(Debug, Clone, Default)]
struct State {
    users: BTreeMap<i32, DbUser>,
    passwords: HashMap<i32, DbPassword>,
    groups: BTreeMap<i32, String>,
    audiences: BTreeMap<i32, String>,
    user_groups: BTreeSet<(i32, i32)>,
    user_audiences: BTreeSet<(i32, i32)>,
    jwt_keys: BTreeMap<i32, DbJwtKey>,
    last_user_id: i32,
    last_group_id: i32,
    last_audience_id: i32,
    last_key_id: i32,
}

impl State {
    fn names_of(names: &BTreeMap<i32, String>, links: &BTreeSet<(i32, i32)>, user_id: i32) -> Vec<String> {
        let mut out: Vec<String> = links
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, id)| names.get(id).cloned())
            .collect();
        out.sort();
        out
    }

    fn link_names(
        names: &mut BTreeMap<i32, String>,
        links: &mut BTreeSet<(i32, i32)>,
        last_id: &mut i32,
        user_id: i32,
        wanted: &[String],
    ) {
        links.retain(|(uid, _)| *uid != user_id);
        for name in wanted {
            let id = match names.iter().find(|(_, n)| *n == name) {
                Some((id, _)) => *id,
                None => {
                    *last_id += 1;
                    names.insert(*last_id, name.clone());
                    *last_id
                }
            };
            links.insert((user_id, id));
        }
    }
}

struct Inner {
    committed: RwLock<Arc<State>>,
    writer: Arc<Mutex<()>>,
    available: AtomicBool,
}

/// Snapshot-isolated in-memory database.
#[derive(Clone)]
pub struct MemoryDb {
    inner: Arc<Inner>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                committed: RwLock::new(Arc::new(State::default())),
                writer: Arc::new(Mutex::new(())),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Make every node (un)reachable. New transactions fail with
    /// [`DbError::Unavailable`] while unavailable.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> DbResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Unavailable("memory database switched off".to_string()))
        }
    }
}

#[async_trait]
impl MultiDb for MemoryDb {
    async fn master_tx(&self) -> DbResult<Box<dyn Transaction>> {
        self.check_available()?;
        let guard = self.inner.writer.clone().lock_owned().await;
        let staged = State::clone(&self.inner.committed.read());
        debug!("memory: begin master tx");
        Ok(Box::new(MemoryTx {
            db: self.inner.clone(),
            stage: Stage::Write {
                staged,
                _guard: guard,
            },
        }))
    }

    async fn replica_tx(&self) -> DbResult<Box<dyn Transaction>> {
        self.check_available()?;
        let snapshot = self.inner.committed.read().clone();
        debug!("memory: begin replica tx");
        Ok(Box::new(MemoryTx {
            db: self.inner.clone(),
            stage: Stage::Read(snapshot),
        }))
    }

    async fn health_check(&self) -> DbResult<()> {
        self.check_available()
    }
}

enum Stage {
    Read(Arc<State>),
    Write {
        staged: State,
        _guard: OwnedMutexGuard<()>,
    },
    Committed,
    RolledBack,
}

struct MemoryTx {
    db: Arc<Inner>,
    stage: Stage,
}

impl MemoryTx {
    fn view(&self) -> DbResult<&State> {
        match &self.stage {
            Stage::Read(state) => Ok(state.as_ref()),
            Stage::Write { staged, .. } => Ok(staged),
            Stage::Committed | Stage::RolledBack => {
                Err(DbError::Transaction("transaction already finished".to_string()))
            }
        }
    }

    fn staged(&mut self, op: &'static str) -> DbResult<&mut State> {
        match &mut self.stage {
            Stage::Write { staged, .. } => Ok(staged),
            Stage::Read(_) => Err(DbError::ReadOnly(op)),
            Stage::Committed | Stage::RolledBack => {
                Err(DbError::Transaction("transaction already finished".to_string()))
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    fn is_read_only(&self) -> bool {
        matches!(self.stage, Stage::Read(_))
    }

    async fn insert_user(&mut self, email: &str, name: Option<&str>) -> DbResult<DbUser> {
        let state = self.staged("insert_user")?;
        let name = name.filter(|n| !n.is_empty());
        if state.users.values().any(|u| u.email == email) {
            return Err(DbError::Duplicate(format!("Email {} already exists", email)));
        }
        if let Some(name) = name {
            if state.users.values().any(|u| u.name.as_deref() == Some(name)) {
                return Err(DbError::Duplicate(format!("Name {} already exists", name)));
            }
        }
        state.last_user_id += 1;
        let now = Utc::now();
        let user = DbUser {
            id: state.last_user_id,
            email: email.to_string(),
            name: name.map(String::from),
            created_at: now,
            updated_at: now,
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user_by_email(&mut self, email: &str) -> DbResult<Option<DbUser>> {
        Ok(self.view()?.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_name(&mut self, name: &str) -> DbResult<Option<DbUser>> {
        Ok(self
            .view()?
            .users
            .values()
            .find(|u| u.name.as_deref() == Some(name))
            .cloned())
    }

    async fn user_groups(&mut self, user_id: i32) -> DbResult<Vec<String>> {
        let state = self.view()?;
        Ok(State::names_of(&state.groups, &state.user_groups, user_id))
    }

    async fn user_audiences(&mut self, user_id: i32) -> DbResult<Vec<String>> {
        let state = self.view()?;
        Ok(State::names_of(&state.audiences, &state.user_audiences, user_id))
    }

    async fn set_user_groups(&mut self, user_id: i32, groups: &[String]) -> DbResult<()> {
        let state = self.staged("set_user_groups")?;
        if !state.users.contains_key(&user_id) {
            return Err(DbError::Constraint(format!("user {} does not exist", user_id)));
        }
        State::link_names(
            &mut state.groups,
            &mut state.user_groups,
            &mut state.last_group_id,
            user_id,
            groups,
        );
        Ok(())
    }

    async fn set_user_audiences(&mut self, user_id: i32, audiences: &[String]) -> DbResult<()> {
        let state = self.staged("set_user_audiences")?;
        if !state.users.contains_key(&user_id) {
            return Err(DbError::Constraint(format!("user {} does not exist", user_id)));
        }
        State::link_names(
            &mut state.audiences,
            &mut state.user_audiences,
            &mut state.last_audience_id,
            user_id,
            audiences,
        );
        Ok(())
    }

    async fn find_password(&mut self, user_id: i32) -> DbResult<Option<DbPassword>> {
        Ok(self.view()?.passwords.get(&user_id).cloned())
    }

    async fn upsert_password(&mut self, user_id: i32, salt: &[u8], hash: &[u8]) -> DbResult<()> {
        let state = self.staged("upsert_password")?;
        if !state.users.contains_key(&user_id) {
            return Err(DbError::Constraint(format!("user {} does not exist", user_id)));
        }
        let now = Utc::now();
        let created_at = state
            .passwords
            .get(&user_id)
            .map(|p| p.created_at)
            .unwrap_or(now);
        state.passwords.insert(
            user_id,
            DbPassword {
                user_id,
                salt: salt.to_vec(),
                hash: hash.to_vec(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn insert_jwt_key(&mut self, public_key: &[u8]) -> DbResult<DbJwtKey> {
        let state = self.staged("insert_jwt_key")?;
        state.last_key_id += 1;
        let key = DbJwtKey {
            id: state.last_key_id,
            public_key: public_key.to_vec(),
            created_at: Utc::now(),
        };
        state.jwt_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn find_jwt_key(&mut self, id: i32) -> DbResult<Option<DbJwtKey>> {
        Ok(self.view()?.jwt_keys.get(&id).cloned())
    }

    async fn commit(&mut self) -> DbResult<()> {
        match std::mem::replace(&mut self.stage, Stage::Committed) {
            Stage::Read(_) => Ok(()),
            Stage::Write { staged, _guard } => {
                *self.db.committed.write() = Arc::new(staged);
                Ok(())
            }
            finished => {
                self.stage = finished;
                Err(DbError::Transaction("transaction already finished".to_string()))
            }
        }
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if !matches!(self.stage, Stage::Committed) {
            self.stage = Stage::RolledBack;
        }
        Ok(())
    }
}
