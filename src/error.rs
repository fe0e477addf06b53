use std::backtrace::Backtrace;
use std::error::Error;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::users::error::{OperationError, ServiceError, StoreError, ValidationError};

/// One link of an error chain as shown to a development client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionPayload {
    pub exception_class: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<ExceptionPayload>>,
}

impl ExceptionPayload {
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        Self {
            exception_class: error_class(err).to_string(),
            message: err.to_string(),
            previous: err.source().map(|cause| Box::new(Self::from_error(cause))),
        }
    }

    /// `Class: message`, then one `Caused by: Class: message` line per cause.
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.exception_class, self.message);
        let mut cause = self.previous.as_deref();
        while let Some(c) = cause {
            out.push_str(&format!("\nCaused by: {}: {}", c.exception_class, c.message));
            cause = c.previous.as_deref();
        }
        out
    }
}

fn error_class(err: &(dyn Error + 'static)) -> &'static str {
    if err.is::<ServiceError>() {
        "ServiceError"
    } else if err.is::<OperationError>() {
        "OperationError"
    } else if err.is::<ValidationError>() {
        "ValidationError"
    } else if err.is::<StoreError>() {
        "StoreError"
    } else if err.is::<sqlx::Error>() {
        "sqlx::Error"
    } else if err.is::<time::error::Parse>() {
        "time::error::Parse"
    } else {
        "Error"
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
    backtrace: Option<Backtrace>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            backtrace: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// In development mode, keeps the error chain and a backtrace for the body.
    pub fn detailed(mut self, dev_mode: bool) -> Self {
        if dev_mode {
            self.backtrace = Some(Backtrace::force_capture());
        } else {
            self.source = None;
        }
        self
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match err.operation() {
            Some(OperationError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(OperationError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(OperationError::Store(StoreError::UnknownPermission(_))) => {
                StatusCode::BAD_REQUEST
            }
            Some(OperationError::Store(StoreError::UsernameTaken(_))) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // client errors name their root cause even outside development mode
        let message = if status.is_client_error() {
            format!("{err}: {}", root_cause(&err))
        } else {
            err.to_string()
        };
        Self {
            status,
            message,
            source: Some(Box::new(err)),
            backtrace: None,
        }
    }
}

fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut cause = err;
    while let Some(next) = cause.source() {
        cause = next;
    }
    cause
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => {
                    let chain = ExceptionPayload::from_error(&**source).render();
                    tracing::error!(status = %self.status, error = %chain, "request failed");
                }
                None => tracing::error!(status = %self.status, error = %self.message, "request failed"),
            }
        }

        let mut body = json!({ "error": self.message });
        if let Some(source) = &self.source {
            body["exception"] = json!(ExceptionPayload::from_error(&**source));
        }
        if let Some(trace) = &self.backtrace {
            body["stacktrace"] = json!(trace.to_string().replace("\r\n", "\n"));
        }

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn update_failure() -> ServiceError {
        ServiceError::Update {
            id: 4,
            source: OperationError::Validation(ValidationError::TooLong {
                field: "username",
                max: 64,
                actual: 70,
            }),
        }
    }

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let res = err.into_response();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn payload_walks_the_source_chain() {
        let err = ServiceError::Delete {
            id: 9,
            source: OperationError::Store(StoreError::MissingUser(9)),
        };
        let payload = ExceptionPayload::from_error(&err);
        assert_eq!(payload.exception_class, "ServiceError");
        assert_eq!(payload.message, "could not delete user 9");
        let cause = payload.previous.as_deref().unwrap();
        assert_eq!(cause.exception_class, "OperationError");
        assert_eq!(cause.message, "store failure");
        let root = cause.previous.as_deref().unwrap();
        assert_eq!(root.exception_class, "StoreError");
        assert_eq!(root.message, "user 9 does not exist in the store");
        assert!(root.previous.is_none());

        let text = payload.render();
        assert_eq!(
            text,
            "ServiceError: could not delete user 9\n\
             Caused by: OperationError: store failure\n\
             Caused by: StoreError: user 9 does not exist in the store"
        );
    }

    #[tokio::test]
    async fn production_body_hides_internals() {
        let (status, body) = body_json(ApiError::from(update_failure()).detailed(false)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "could not update user 4: username must be at most 64 characters long, got 70"
        );
        assert!(body.get("exception").is_none());
        assert!(body.get("stacktrace").is_none());
    }

    #[tokio::test]
    async fn dev_body_carries_chain_and_stacktrace() {
        let (_, body) = body_json(ApiError::from(update_failure()).detailed(true)).await;
        assert_eq!(body["exception"]["exceptionClass"], "ServiceError");
        assert_eq!(body["exception"]["previous"]["exceptionClass"], "OperationError");
        assert_eq!(
            body["exception"]["previous"]["previous"]["exceptionClass"],
            "ValidationError"
        );
        assert_eq!(
            body["exception"]["previous"]["previous"]["message"],
            "username must be at most 64 characters long, got 70"
        );
        let trace = body["stacktrace"].as_str().unwrap();
        assert!(!trace.contains("\r\n"));
    }

    #[tokio::test]
    async fn taken_username_is_a_conflict() {
        let err = ServiceError::Create {
            username: "alice".into(),
            email: "a@x.io".into(),
            source: OperationError::Store(StoreError::UsernameTaken("alice".into())),
        };
        let (status, body) = body_json(ApiError::from(err).detailed(false)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body["error"],
            "could not create user \"alice\" <a@x.io>: username \"alice\" is already taken"
        );
    }

    #[tokio::test]
    async fn unknown_permission_names_the_id() {
        let err = ServiceError::Update {
            id: 2,
            source: OperationError::Store(StoreError::UnknownPermission(99)),
        };
        let (status, body) = body_json(ApiError::from(err).detailed(false)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "could not update user 2: permission 99 does not exist");
    }

    #[test]
    fn not_found_cause_maps_to_404() {
        let err = ServiceError::Update {
            id: 1,
            source: OperationError::NotFound(1),
        };
        assert_eq!(ApiError::from(err).status(), StatusCode::NOT_FOUND);
    }
}
