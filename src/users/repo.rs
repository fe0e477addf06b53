use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{pool::PoolConnection, PgConnection, PgPool, Postgres, Transaction};
use time::PrimitiveDateTime;
use tracing::debug;

use crate::config::UserRules;
use crate::users::dto::UserDto;
use crate::users::error::{StoreError, ValidationError};
use crate::users::repo_types::{Permission, PgUserRow};

/// Row-level access to the `users` table.
#[async_trait]
pub trait UserDao: Send {
    async fn get_all(&mut self) -> Result<Vec<UserDto>, StoreError>;
    async fn get_by_id(&mut self, id: i64) -> Result<Option<UserDto>, StoreError>;
    async fn get_by_username(&mut self, username: &str) -> Result<Option<UserDto>, StoreError>;
    /// Inserts the user and stamps its id and creation date.
    async fn create(&mut self, user: &mut UserDto) -> Result<(), StoreError>;
    /// Persists field changes and stamps the last modification date.
    async fn update(&mut self, user: &mut UserDto) -> Result<(), StoreError>;
    async fn delete(&mut self, user: &UserDto) -> Result<(), StoreError>;
}

/// Many-to-many links between users and permissions.
#[async_trait]
pub trait UserPermissionDao: Send {
    async fn create_many(&mut self, user_id: i64, permission_ids: &[i64])
        -> Result<(), StoreError>;
    async fn delete_all_by_user_id(&mut self, user_id: i64) -> Result<u64, StoreError>;
    /// Permissions linked to the user, ordered by permission id.
    async fn get_by_user_id(&mut self, user_id: i64) -> Result<Vec<Permission>, StoreError>;
}

/// One store connection. Transactional sessions roll back when dropped uncommitted.
#[async_trait]
pub trait Session: UserDao + UserPermissionDao {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Autocommit session; `commit`/`rollback` are no-ops.
    async fn session(&self) -> Result<Box<dyn Session>, StoreError>;
    /// Transactional session isolated at least against dirty reads.
    async fn begin(&self) -> Result<Box<dyn Session>, StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    rules: Arc<UserRules>,
}

impl PgStore {
    pub fn new(pool: PgPool, rules: Arc<UserRules>) -> Self {
        Self { pool, rules }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn session(&self) -> Result<Box<dyn Session>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession {
            conn: PgConn::Pooled(conn),
            rules: self.rules.clone(),
        }))
    }

    async fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        debug!("transaction started");
        Ok(Box::new(PgSession {
            conn: PgConn::Tx(tx),
            rules: self.rules.clone(),
        }))
    }
}

enum PgConn {
    Pooled(PoolConnection<Postgres>),
    Tx(Transaction<'static, Postgres>),
}

pub struct PgSession {
    conn: PgConn,
    rules: Arc<UserRules>,
}

const USER_COLUMNS: &str = "id, username, password_hash, email, created_at, last_modified_at";

impl PgSession {
    fn conn(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            PgConn::Pooled(conn) => &mut **conn,
            PgConn::Tx(tx) => &mut **tx,
        }
    }

    fn hydrate(&self, record: PgUserRow) -> Result<UserDto, StoreError> {
        let id = record.id;
        let row = record.into_row(&self.rules).map_err(|source| {
            ValidationError::Unformattable {
                field: "users row",
                value: id.to_string(),
                source,
            }
        })?;
        Ok(UserDto::from_row(self.rules.clone(), &row)?)
    }
}

fn username_conflict(e: sqlx::Error, username: &str) -> StoreError {
    let taken = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
    if taken {
        StoreError::UsernameTaken(username.to_string())
    } else {
        StoreError::Database(e)
    }
}

#[async_trait]
impl UserDao for PgSession {
    async fn get_all(&mut self) -> Result<Vec<UserDto>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY id");
        let records = sqlx::query_as::<_, PgUserRow>(&sql)
            .fetch_all(self.conn())
            .await?;
        records.into_iter().map(|r| self.hydrate(r)).collect()
    }

    async fn get_by_id(&mut self, id: i64) -> Result<Option<UserDto>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let record = sqlx::query_as::<_, PgUserRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await?;
        record.map(|r| self.hydrate(r)).transpose()
    }

    async fn get_by_username(&mut self, username: &str) -> Result<Option<UserDto>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let record = sqlx::query_as::<_, PgUserRow>(&sql)
            .bind(username)
            .fetch_optional(self.conn())
            .await?;
        record.map(|r| self.hydrate(r)).transpose()
    }

    async fn create(&mut self, user: &mut UserDto) -> Result<(), StoreError> {
        let (id, created_at) = sqlx::query_as::<_, (i64, PrimitiveDateTime)>(
            r#"
            INSERT INTO users (username, password_hash, email)
            VALUES ($1, $2, $3)
            RETURNING id, created_at
            "#,
        )
        .bind(user.username())
        .bind(user.password_hash())
        .bind(user.email())
        .fetch_one(self.conn())
        .await
        .map_err(|e| username_conflict(e, user.username()))?;
        user.set_id(id)?;
        user.set_creation_date(created_at);
        Ok(())
    }

    async fn update(&mut self, user: &mut UserDto) -> Result<(), StoreError> {
        let id = user.ensure_updatable()?;
        let modified = sqlx::query_scalar::<_, PrimitiveDateTime>(
            r#"
            UPDATE users
               SET username = $1,
                   password_hash = $2,
                   email = $3,
                   last_modified_at = (now() AT TIME ZONE 'utc')
             WHERE id = $4
            RETURNING last_modified_at
            "#,
        )
        .bind(user.username())
        .bind(user.password_hash())
        .bind(user.email())
        .bind(id)
        .fetch_optional(self.conn())
        .await
        .map_err(|e| username_conflict(e, user.username()))?
        .ok_or(StoreError::MissingUser(id))?;
        user.set_last_modification_date(Some(modified));
        Ok(())
    }

    async fn delete(&mut self, user: &UserDto) -> Result<(), StoreError> {
        let id = user.ensure_deletable()?;
        let done = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::MissingUser(id));
        }
        Ok(())
    }
}

#[async_trait]
impl UserPermissionDao for PgSession {
    async fn create_many(
        &mut self,
        user_id: i64,
        permission_ids: &[i64],
    ) -> Result<(), StoreError> {
        // repeated ids would trip the (user_id, permission_id) key
        let unique: BTreeSet<i64> = permission_ids.iter().copied().collect();
        for permission_id in unique {
            sqlx::query(
                r#"
                INSERT INTO user_permissions (user_id, permission_id)
                VALUES ($1, $2)
                "#,
            )
            .bind(user_id)
            .bind(permission_id)
            .execute(self.conn())
            .await
            .map_err(|e| {
                let unknown = matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation());
                if unknown {
                    StoreError::UnknownPermission(permission_id)
                } else {
                    StoreError::Database(e)
                }
            })?;
        }
        Ok(())
    }

    async fn delete_all_by_user_id(&mut self, user_id: i64) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM user_permissions WHERE user_id = $1")
            .bind(user_id)
            .execute(self.conn())
            .await?;
        Ok(done.rows_affected())
    }

    async fn get_by_user_id(&mut self, user_id: i64) -> Result<Vec<Permission>, StoreError> {
        let permissions = sqlx::query_as::<_, Permission>(
            r#"
            SELECT p.id, p.identifier, p.description
              FROM permissions p
              JOIN user_permissions up ON up.permission_id = p.id
             WHERE up.user_id = $1
             ORDER BY p.id
            "#,
        )
        .bind(user_id)
        .fetch_all(self.conn())
        .await?;
        Ok(permissions)
    }
}

#[async_trait]
impl Session for PgSession {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if let PgConn::Tx(tx) = self.conn {
            tx.commit().await?;
            debug!("transaction committed");
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if let PgConn::Tx(tx) = self.conn {
            tx.rollback().await?;
            debug!("transaction rolled back");
        }
        Ok(())
    }
}
