//! In-memory [`Store`] for tests. Transactions work on a snapshot of the
//! tables that replaces the shared copy on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::config::UserRules;
use crate::users::dto::UserDto;
use crate::users::error::{StoreError, ValidationError};
use crate::users::repo::{Session, Store, UserDao, UserPermissionDao};
use crate::users::repo_types::{Permission, PgUserRow};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, PgUserRow>,
    permissions: BTreeMap<i64, Permission>,
    links: BTreeSet<(i64, i64)>,
}

impl Tables {
    /// Mirrors the `UNIQUE (username)` constraint.
    fn username_taken(&self, username: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|r| r.username == username && Some(r.id) != except)
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Tables>>,
    failures: Arc<Mutex<BTreeSet<&'static str>>>,
    rules: Arc<UserRules>,
}

impl MemoryStore {
    pub fn new(rules: Arc<UserRules>) -> Self {
        let mut tables = Tables::default();
        for (id, identifier) in [(1, "users.read"), (2, "users.write"), (3, "users.delete")] {
            tables.permissions.insert(
                id,
                Permission {
                    id,
                    identifier: identifier.into(),
                    description: format!("{identifier} permission"),
                },
            );
        }
        Self {
            shared: Arc::new(Mutex::new(tables)),
            failures: Arc::default(),
            rules,
        }
    }

    /// Makes every later call of the named DAO operation fail.
    pub fn fail_on(&self, operation: &'static str) {
        self.failures.lock().unwrap().insert(operation);
    }

    pub fn user_count(&self) -> usize {
        self.shared.lock().unwrap().users.len()
    }

    pub fn link_count(&self, user_id: i64) -> usize {
        self.shared
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|(u, _)| *u == user_id)
            .count()
    }

    pub fn stored_username(&self, user_id: i64) -> Option<String> {
        self.shared
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .map(|r| r.username.clone())
    }

    fn open(&self, transactional: bool) -> Box<dyn Session> {
        let work = transactional.then(|| self.shared.lock().unwrap().clone());
        Box::new(MemorySession {
            shared: self.shared.clone(),
            failures: self.failures.clone(),
            rules: self.rules.clone(),
            work,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(self.open(false))
    }

    async fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(self.open(true))
    }
}

struct MemorySession {
    shared: Arc<Mutex<Tables>>,
    failures: Arc<Mutex<BTreeSet<&'static str>>>,
    rules: Arc<UserRules>,
    work: Option<Tables>,
}

impl MemorySession {
    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.failures.lock().unwrap().contains(operation) {
            return Err(StoreError::Backend(format!("injected failure in {operation}")));
        }
        Ok(())
    }

    fn tables<R>(&mut self, f: impl FnOnce(&mut Tables) -> R) -> R {
        match &mut self.work {
            Some(tables) => f(tables),
            None => f(&mut self.shared.lock().unwrap()),
        }
    }

    fn hydrate(&self, record: PgUserRow) -> Result<UserDto, StoreError> {
        let id = record.id;
        let row = record
            .into_row(&self.rules)
            .map_err(|source| ValidationError::Unformattable {
                field: "users row",
                value: id.to_string(),
                source,
            })?;
        Ok(UserDto::from_row(self.rules.clone(), &row)?)
    }
}

fn now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

#[async_trait]
impl UserDao for MemorySession {
    async fn get_all(&mut self) -> Result<Vec<UserDto>, StoreError> {
        self.check("get_all")?;
        let records: Vec<_> = self.tables(|t| t.users.values().cloned().collect());
        records.into_iter().map(|r| self.hydrate(r)).collect()
    }

    async fn get_by_id(&mut self, id: i64) -> Result<Option<UserDto>, StoreError> {
        self.check("get_by_id")?;
        let record = self.tables(|t| t.users.get(&id).cloned());
        record.map(|r| self.hydrate(r)).transpose()
    }

    async fn get_by_username(&mut self, username: &str) -> Result<Option<UserDto>, StoreError> {
        self.check("get_by_username")?;
        let record = self.tables(|t| t.users.values().find(|r| r.username == username).cloned());
        record.map(|r| self.hydrate(r)).transpose()
    }

    async fn create(&mut self, user: &mut UserDto) -> Result<(), StoreError> {
        self.check("create")?;
        let created_at = now();
        let (username, password_hash, email) = (
            user.username().to_string(),
            user.password_hash().to_string(),
            user.email().to_string(),
        );
        let id = self.tables(|t| {
            if t.username_taken(&username, None) {
                return Err(StoreError::UsernameTaken(username));
            }
            t.next_id += 1;
            let id = t.next_id;
            t.users.insert(
                id,
                PgUserRow {
                    id,
                    username,
                    password_hash,
                    email,
                    created_at,
                    last_modified_at: None,
                },
            );
            Ok(id)
        })?;
        user.set_id(id)?;
        user.set_creation_date(created_at);
        Ok(())
    }

    async fn update(&mut self, user: &mut UserDto) -> Result<(), StoreError> {
        self.check("update")?;
        let id = user.ensure_updatable()?;
        let modified = now();
        let (username, password_hash, email) = (
            user.username().to_string(),
            user.password_hash().to_string(),
            user.email().to_string(),
        );
        self.tables(|t| {
            if t.username_taken(&username, Some(id)) {
                return Err(StoreError::UsernameTaken(username));
            }
            let record = t.users.get_mut(&id).ok_or(StoreError::MissingUser(id))?;
            record.username = username;
            record.password_hash = password_hash;
            record.email = email;
            record.last_modified_at = Some(modified);
            Ok::<_, StoreError>(())
        })?;
        user.set_last_modification_date(Some(modified));
        Ok(())
    }

    async fn delete(&mut self, user: &UserDto) -> Result<(), StoreError> {
        self.check("delete")?;
        let id = user.ensure_deletable()?;
        self.tables(|t| match t.users.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::MissingUser(id)),
        })
    }
}

#[async_trait]
impl UserPermissionDao for MemorySession {
    async fn create_many(
        &mut self,
        user_id: i64,
        permission_ids: &[i64],
    ) -> Result<(), StoreError> {
        self.check("create_many")?;
        self.tables(|t| {
            if !t.users.contains_key(&user_id) {
                return Err(StoreError::MissingUser(user_id));
            }
            // the link set merges repeated ids, as the Postgres session does
            for &permission_id in permission_ids {
                if !t.permissions.contains_key(&permission_id) {
                    return Err(StoreError::UnknownPermission(permission_id));
                }
                t.links.insert((user_id, permission_id));
            }
            Ok(())
        })
    }

    async fn delete_all_by_user_id(&mut self, user_id: i64) -> Result<u64, StoreError> {
        self.check("delete_all_by_user_id")?;
        Ok(self.tables(|t| {
            let before = t.links.len();
            t.links.retain(|(u, _)| *u != user_id);
            (before - t.links.len()) as u64
        }))
    }

    async fn get_by_user_id(&mut self, user_id: i64) -> Result<Vec<Permission>, StoreError> {
        self.check("get_by_user_id")?;
        Ok(self.tables(|t| {
            t.links
                .iter()
                .filter(|(u, _)| *u == user_id)
                .filter_map(|(_, p)| t.permissions.get(p).cloned())
                .collect()
        }))
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(work) = self.work {
            *self.shared.lock().unwrap() = work;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
