use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::config::UserRules;

/// Textual projection of one `users` row, as handed to [`UserDto::from_row`].
///
/// [`UserDto::from_row`]: super::dto::UserDto::from_row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRow {
    pub id: Option<String>,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub created_at: Option<String>,
    pub last_modified_at: Option<String>,
}

/// Typed `users` row as Postgres returns it.
#[derive(Debug, Clone, FromRow)]
pub struct PgUserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub created_at: PrimitiveDateTime,
    pub last_modified_at: Option<PrimitiveDateTime>,
}

impl PgUserRow {
    /// Renders the record with the configured store datetime format.
    pub fn into_row(self, rules: &UserRules) -> Result<UserRow, time::error::Format> {
        let last_modified_at = match self.last_modified_at {
            Some(at) => Some(at.format(&rules.store_datetime)?),
            None => None,
        };
        Ok(UserRow {
            id: Some(self.id.to_string()),
            username: Some(self.username),
            password_hash: Some(self.password_hash),
            email: Some(self.email),
            created_at: Some(self.created_at.format(&rules.store_datetime)?),
            last_modified_at,
        })
    }
}

/// A permission a user can be associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: i64,
    pub identifier: String,
    pub description: String,
}
