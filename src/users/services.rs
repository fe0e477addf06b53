use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::auth::password::{hash_password, verify_password};
use crate::config::UserRules;
use crate::users::dto::UserDto;
use crate::users::error::{OperationError, ServiceError, StoreError};
use crate::users::repo::{Session, Store, UserDao, UserPermissionDao};
use crate::users::repo_types::Permission;

/// Outcome of [`UsersService::validate_credentials`].
#[derive(Debug)]
pub enum CredentialCheck {
    Valid(UserDto),
    /// The username exists but the password does not match.
    Invalid,
    NotFound,
}

/// User CRUD over a [`Store`]. `create`, `update` and `delete` each run in
/// one transaction that is rolled back on any failure.
#[derive(Clone)]
pub struct UsersService {
    store: Arc<dyn Store>,
    rules: Arc<UserRules>,
}

impl UsersService {
    pub fn new(store: Arc<dyn Store>, rules: Arc<UserRules>) -> Self {
        Self { store, rules }
    }

    /// All users, permissions not loaded.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<UserDto>, ServiceError> {
        let mut session = self.store.session().await?;
        Ok(session.get_all().await?)
    }

    /// The user with its permissions loaded, or `None` if there is no such row.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserDto>, ServiceError> {
        let mut session = self.store.session().await?;
        fetch_with_permissions(&mut *session, id)
            .await
            .map_err(|source| ServiceError::Load { id, source })
    }

    #[instrument(skip(self, password, permission_ids), fields(permissions = permission_ids.len()))]
    pub async fn create(
        &self,
        username: &str,
        password: &str,
        email: &str,
        permission_ids: &[i64],
    ) -> Result<UserDto, ServiceError> {
        let wrap = |source: OperationError| ServiceError::Create {
            username: username.to_string(),
            email: email.to_string(),
            source,
        };

        let mut tx = self.store.begin().await.map_err(|e| wrap(e.into()))?;
        let id = match self
            .insert(&mut *tx, username, password, email, permission_ids)
            .await
        {
            Ok(id) => id,
            Err(source) => {
                abort(tx).await;
                error!(error = %source, "user creation rolled back");
                return Err(wrap(source));
            }
        };
        tx.commit().await.map_err(|e| wrap(e.into()))?;
        info!(user_id = id, "user created");

        // committed; a failed read-back is not a failed creation
        self.refetch(id)
            .await
            .map_err(|source| ServiceError::Load { id, source })
    }

    #[instrument(skip(self, password, permission_ids), fields(permissions = permission_ids.len()))]
    pub async fn update(
        &self,
        id: i64,
        username: &str,
        password: &str,
        email: &str,
        permission_ids: &[i64],
    ) -> Result<UserDto, ServiceError> {
        let wrap = |source: OperationError| ServiceError::Update { id, source };

        let mut tx = self.store.begin().await.map_err(|e| wrap(e.into()))?;
        if let Err(source) = self
            .apply_update(&mut *tx, id, username, password, email, permission_ids)
            .await
        {
            abort(tx).await;
            warn!(error = %source, "user update rolled back");
            return Err(wrap(source));
        }
        tx.commit().await.map_err(|e| wrap(e.into()))?;
        info!("user updated");

        self.refetch(id)
            .await
            .map_err(|source| ServiceError::Load { id, source })
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let wrap = |source: OperationError| ServiceError::Delete { id, source };

        let mut tx = self.store.begin().await.map_err(|e| wrap(e.into()))?;
        if let Err(source) = remove(&mut *tx, id).await {
            abort(tx).await;
            warn!(error = %source, "user deletion rolled back");
            return Err(wrap(source));
        }
        tx.commit().await.map_err(|e| wrap(e.into()))?;
        info!("user deleted");
        Ok(())
    }

    pub async fn get_permissions_by_user_id(
        &self,
        id: i64,
    ) -> Result<Vec<Permission>, ServiceError> {
        let mut session = self.store.session().await?;
        Ok(session.get_by_user_id(id).await?)
    }

    /// Reloads `user`'s permissions from the store and returns them.
    pub async fn get_permissions(&self, user: &mut UserDto) -> Result<Vec<Permission>, ServiceError> {
        let mut session = self.store.session().await?;
        let permissions = user
            .permissions(&mut *session)
            .await
            .map_err(ServiceError::Permissions)?;
        Ok(permissions.to_vec())
    }

    #[instrument(skip(self, password))]
    pub async fn validate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialCheck, ServiceError> {
        let mut session = self.store.session().await?;
        let Some(user) = session.get_by_username(username).await? else {
            warn!("login for unknown username");
            return Ok(CredentialCheck::NotFound);
        };
        let matches = verify_password(password, user.password_hash())
            .map_err(|e| ServiceError::Credentials(OperationError::Hash(e.to_string())))?;
        if !matches {
            warn!(user_id = ?user.id(), "login with wrong password");
            return Ok(CredentialCheck::Invalid);
        }
        Ok(CredentialCheck::Valid(user))
    }

    async fn insert(
        &self,
        session: &mut dyn Session,
        username: &str,
        password: &str,
        email: &str,
        permission_ids: &[i64],
    ) -> Result<i64, OperationError> {
        let hash = hash(password)?;
        let mut user = UserDto::for_insertion(self.rules.clone(), username, &hash, email)?;
        user.ensure_insertable()?;
        session.create(&mut user).await?;
        let id = user
            .id()
            .ok_or_else(|| StoreError::Backend("store did not assign an id".into()))?;
        if !permission_ids.is_empty() {
            session.create_many(id, permission_ids).await?;
        }
        Ok(id)
    }

    async fn apply_update(
        &self,
        session: &mut dyn Session,
        id: i64,
        username: &str,
        password: &str,
        email: &str,
        permission_ids: &[i64],
    ) -> Result<(), OperationError> {
        let mut user = session
            .get_by_id(id)
            .await?
            .ok_or(OperationError::NotFound(id))?;
        let hash = hash(password)?;
        user.set_username(username)?;
        user.set_password_hash(&hash)?;
        user.set_email(email)?;
        user.ensure_updatable()?;
        session.update(&mut user).await?;

        session.delete_all_by_user_id(id).await?;
        if !permission_ids.is_empty() {
            session.create_many(id, permission_ids).await?;
        }
        Ok(())
    }

    async fn refetch(&self, id: i64) -> Result<UserDto, OperationError> {
        let mut session = self.store.session().await?;
        fetch_with_permissions(&mut *session, id)
            .await?
            .ok_or(OperationError::NotFound(id))
    }
}

async fn fetch_with_permissions(
    session: &mut dyn Session,
    id: i64,
) -> Result<Option<UserDto>, OperationError> {
    let Some(mut user) = session.get_by_id(id).await? else {
        return Ok(None);
    };
    user.load_permissions(session).await?;
    Ok(Some(user))
}

async fn remove(session: &mut dyn Session, id: i64) -> Result<(), OperationError> {
    let user = session
        .get_by_id(id)
        .await?
        .ok_or(OperationError::NotFound(id))?;
    session.delete_all_by_user_id(id).await?;
    session.delete(&user).await?;
    Ok(())
}

async fn abort(tx: Box<dyn Session>) {
    if let Err(e) = tx.rollback().await {
        error!(error = %e, "rollback failed");
    }
}

fn hash(password: &str) -> Result<String, OperationError> {
    hash_password(password).map_err(|e| OperationError::Hash(e.to_string()))
}
