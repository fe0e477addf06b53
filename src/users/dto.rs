use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::PrimitiveDateTime;

use crate::config::UserRules;
use crate::users::error::{OperationError, ValidationError};
use crate::users::repo::UserPermissionDao;
use crate::users::repo_types::{Permission, UserRow};

/// In-memory user, validated on every mutation.
///
/// Permissions are not loaded with the user; see [`UserDto::get_permissions`].
#[derive(Debug, Clone)]
pub struct UserDto {
    rules: Arc<UserRules>,
    id: Option<i64>,
    username: String,
    password_hash: String,
    email: String,
    creation_date: Option<PrimitiveDateTime>,
    last_modification_date: Option<PrimitiveDateTime>,
    permissions: Vec<Permission>,
}

/// Plain record produced by [`UserDto::serialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedUser {
    pub id: Option<i64>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: String,
    pub creation_date: Option<String>,
    pub last_modification_date: Option<String>,
    pub permissions: BTreeMap<i64, Permission>,
}

impl UserDto {
    pub fn new(rules: Arc<UserRules>) -> Self {
        Self {
            rules,
            id: None,
            username: String::new(),
            password_hash: String::new(),
            email: String::new(),
            creation_date: None,
            last_modification_date: None,
            permissions: Vec::new(),
        }
    }

    /// A user ready to be inserted: no id, no timestamps.
    pub fn for_insertion(
        rules: Arc<UserRules>,
        username: &str,
        password_hash: &str,
        email: &str,
    ) -> Result<Self, ValidationError> {
        let mut user = Self::new(rules);
        user.set_username(username)?;
        user.set_password_hash(password_hash)?;
        user.set_email(email)?;
        Ok(user)
    }

    /// Builds a user from a store row, re-validating every field.
    pub fn from_row(rules: Arc<UserRules>, row: &UserRow) -> Result<Self, ValidationError> {
        let raw_id = required(&row.id, "id")?;
        let id = raw_id
            .trim()
            .parse::<i64>()
            .map_err(|_| ValidationError::NonNumericId {
                value: raw_id.to_string(),
            })?;
        let username = required(&row.username, "username")?;
        let password_hash = required(&row.password_hash, "password_hash")?;
        let created_at = required(&row.created_at, "created_at")?;

        let mut user = Self::new(rules);
        user.set_id(id)?;
        user.set_username(username)?;
        user.set_password_hash(password_hash)?;
        if let Some(email) = row.email.as_deref() {
            user.set_email(email)?;
        }
        user.creation_date = Some(user.parse_store_date("created_at", created_at)?);
        user.last_modification_date = match row.last_modified_at.as_deref() {
            Some(raw) if !raw.is_empty() => {
                Some(user.parse_store_date("last_modified_at", raw)?)
            }
            _ => None,
        };
        Ok(user)
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn set_id(&mut self, id: i64) -> Result<(), ValidationError> {
        if id < 1 {
            return Err(ValidationError::InvalidId(id));
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: &str) -> Result<(), ValidationError> {
        check_len("username", username, self.rules.username_max_chars)?;
        self.username = username.to_string();
        Ok(())
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn set_password_hash(&mut self, password_hash: &str) -> Result<(), ValidationError> {
        check_len(
            "password_hash",
            password_hash,
            self.rules.password_hash_max_chars,
        )?;
        self.password_hash = password_hash.to_string();
        Ok(())
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn set_email(&mut self, email: &str) -> Result<(), ValidationError> {
        check_len("email", email, self.rules.email_max_chars)?;
        self.email = email.to_string();
        Ok(())
    }

    pub fn creation_date(&self) -> Option<PrimitiveDateTime> {
        self.creation_date
    }

    pub fn set_creation_date(&mut self, at: PrimitiveDateTime) {
        self.creation_date = Some(at);
    }

    pub fn last_modification_date(&self) -> Option<PrimitiveDateTime> {
        self.last_modification_date
    }

    pub fn set_last_modification_date(&mut self, at: Option<PrimitiveDateTime>) {
        self.last_modification_date = at;
    }

    pub fn validate_for_insertion(&self) -> bool {
        self.ensure_insertable().is_ok()
    }

    pub fn validate_for_update(&self) -> bool {
        self.ensure_updatable().is_ok()
    }

    pub fn validate_for_deletion(&self) -> bool {
        self.ensure_deletable().is_ok()
    }

    /// Strict form of [`Self::validate_for_insertion`].
    pub fn ensure_insertable(&self) -> Result<(), ValidationError> {
        const OP: &str = "insertion";
        if self.id.is_some() {
            return Err(precondition(OP, "id must not be set"));
        }
        if self.creation_date.is_some() {
            return Err(precondition(OP, "creation date must not be set"));
        }
        if self.last_modification_date.is_some() {
            return Err(precondition(OP, "last modification date must not be set"));
        }
        self.ensure_required_fields(OP)
    }

    /// Strict form of [`Self::validate_for_update`]; yields the id.
    pub fn ensure_updatable(&self) -> Result<i64, ValidationError> {
        const OP: &str = "update";
        let id = self.id.ok_or_else(|| precondition(OP, "id must be set"))?;
        self.ensure_required_fields(OP)?;
        Ok(id)
    }

    /// Strict form of [`Self::validate_for_deletion`]; yields the id.
    pub fn ensure_deletable(&self) -> Result<i64, ValidationError> {
        self.id
            .ok_or_else(|| precondition("deletion", "id must be set"))
    }

    fn ensure_required_fields(&self, operation: &'static str) -> Result<(), ValidationError> {
        if self.username.is_empty() {
            return Err(precondition(operation, "username must be set"));
        }
        if self.password_hash.is_empty() {
            return Err(precondition(operation, "password hash must be set"));
        }
        if self.email.is_empty() {
            return Err(precondition(operation, "email must be set"));
        }
        Ok(())
    }

    /// Replaces the in-memory permissions with the store's current links.
    pub async fn load_permissions<D>(&mut self, dao: &mut D) -> Result<(), OperationError>
    where
        D: UserPermissionDao + ?Sized,
    {
        let id = self
            .id
            .ok_or_else(|| precondition("permission loading", "id must be set"))?;
        self.permissions = dao.get_by_user_id(id).await?;
        Ok(())
    }

    /// Reloads unless `force_reload` is false and permissions are already cached.
    pub async fn get_permissions<D>(
        &mut self,
        dao: &mut D,
        force_reload: bool,
    ) -> Result<&[Permission], OperationError>
    where
        D: UserPermissionDao + ?Sized,
    {
        if force_reload || self.permissions.is_empty() {
            self.load_permissions(dao).await?;
        }
        Ok(&self.permissions)
    }

    /// Always reloads; pass through [`Self::get_permissions`] to use the cache.
    pub async fn permissions<D>(&mut self, dao: &mut D) -> Result<&[Permission], OperationError>
    where
        D: UserPermissionDao + ?Sized,
    {
        self.get_permissions(dao, true).await
    }

    /// Permissions as last loaded, without touching the store.
    pub fn loaded_permissions(&self) -> &[Permission] {
        &self.permissions
    }

    pub fn serialize(&self) -> Result<SerializedUser, ValidationError> {
        Ok(SerializedUser {
            id: self.id,
            username: self.username.clone(),
            password_hash: self.password_hash.clone(),
            email: self.email.clone(),
            creation_date: self
                .creation_date
                .map(|at| self.format_display("creation_date", at))
                .transpose()?,
            last_modification_date: self
                .last_modification_date
                .map(|at| self.format_display("last_modification_date", at))
                .transpose()?,
            permissions: self
                .permissions
                .iter()
                .map(|p| (p.id, p.clone()))
                .collect(),
        })
    }

    fn parse_store_date(
        &self,
        field: &'static str,
        raw: &str,
    ) -> Result<PrimitiveDateTime, ValidationError> {
        PrimitiveDateTime::parse(raw, &self.rules.store_datetime).map_err(|source| {
            ValidationError::InvalidDate {
                field,
                value: raw.to_string(),
                source,
            }
        })
    }

    fn format_display(
        &self,
        field: &'static str,
        at: PrimitiveDateTime,
    ) -> Result<String, ValidationError> {
        at.format(&self.rules.display_datetime)
            .map_err(|source| ValidationError::Unformattable {
                field,
                value: at.to_string(),
                source,
            })
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::Missing { field }),
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    // bounds are in characters, not bytes
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong { field, max, actual });
    }
    Ok(())
}

fn precondition(operation: &'static str, reason: &'static str) -> ValidationError {
    ValidationError::Precondition { operation, reason }
}
