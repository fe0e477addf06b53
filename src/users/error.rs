use thiserror::Error;

/// A field bound or object-state precondition was violated.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be at most {max} characters long, got {actual}")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("id must be a positive integer, got {0}")]
    InvalidId(i64),

    #[error("id {value:?} is not numeric")]
    NonNumericId { value: String },

    #[error("{field} {value:?} does not match the store datetime format")]
    InvalidDate {
        field: &'static str,
        value: String,
        #[source]
        source: time::error::Parse,
    },

    #[error("{field} {value:?} cannot be formatted")]
    Unformattable {
        field: &'static str,
        value: String,
        #[source]
        source: time::error::Format,
    },

    #[error("user is not valid for {operation}: {reason}")]
    Precondition {
        operation: &'static str,
        reason: &'static str,
    },
}

/// Failures raised by a [`Store`](super::repo::Store) or one of its sessions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("invalid user data")]
    Invalid(#[from] ValidationError),

    #[error("permission {0} does not exist")]
    UnknownPermission(i64),

    #[error("username {0:?} is already taken")]
    UsernameTaken(String),

    #[error("user {0} does not exist in the store")]
    MissingUser(i64),

    #[error("store failure: {0}")]
    Backend(String),
}

/// Cause carried by a wrapped create/update/delete failure.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid user")]
    Validation(#[from] ValidationError),

    #[error("store failure")]
    Store(#[from] StoreError),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("user {0} does not exist")]
    NotFound(i64),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not create user {username:?} <{email}>")]
    Create {
        username: String,
        email: String,
        #[source]
        source: OperationError,
    },

    #[error("could not update user {id}")]
    Update {
        id: i64,
        #[source]
        source: OperationError,
    },

    #[error("could not delete user {id}")]
    Delete {
        id: i64,
        #[source]
        source: OperationError,
    },

    #[error("could not load user {id}")]
    Load {
        id: i64,
        #[source]
        source: OperationError,
    },

    #[error("could not load permissions")]
    Permissions(#[source] OperationError),

    #[error("could not check credentials")]
    Credentials(#[source] OperationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Innermost cause in this crate's taxonomy, used for status mapping.
    pub fn operation(&self) -> Option<&OperationError> {
        match self {
            Self::Create { source, .. }
            | Self::Update { source, .. }
            | Self::Delete { source, .. }
            | Self::Load { source, .. }
            | Self::Permissions(source)
            | Self::Credentials(source) => Some(source),
            Self::Store(_) => None,
        }
    }
}
