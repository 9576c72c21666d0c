#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> Maybe<()> {
    Nothing(Error::not_found(format!("Invalid path: {}", path)))
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Every failure a request can end with. Serialized as `{"error": "<Kind>", "message": ..}`.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "error")]
pub enum Error {
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    DuplicateCode { message: String },
    #[error("{message}")]
    DuplicateEnrollment { message: String },
    #[error("{message}")]
    CapacityExceeded { message: String },
    #[error("{message}")]
    ScheduleConflict { message: String },
    #[error("{message}")]
    AlreadyMarked { message: String },
    #[error("{message}")]
    SessionExpired { message: String },
    #[error("{message}")]
    NotEnrolled { message: String },
    #[error("{message}")]
    Forbidden { message: String },
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    InvalidPayload { message: String },
    /// A concurrent write claimed the same unique key first.
    #[error("{message}")]
    Conflict { message: String },
    #[error("{kind}: {message}")]
    InternalError { kind: &'static str, message: String },
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateCode { .. }
            | Error::DuplicateEnrollment { .. }
            | Error::CapacityExceeded { .. }
            | Error::ScheduleConflict { .. }
            | Error::AlreadyMarked { .. }
            | Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::SessionExpired { .. } => StatusCode::GONE,
            Error::NotEnrolled { .. } | Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Error {
        Error::Forbidden {
            message: msg.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Error {
        Error::Unauthorized {
            message: msg.into(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn internal<S: Into<String>>(kind: &'static str, msg: S) -> Error {
        Error::InternalError {
            kind,
            message: msg.into(),
        }
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Error {
        Error::Conflict {
            message: msg.into(),
        }
    }

    pub fn duplicate_code() -> Error {
        Error::DuplicateCode {
            message: "Class code already exists".to_string(),
        }
    }

    pub fn duplicate_enrollment() -> Error {
        Error::DuplicateEnrollment {
            message: "Student is already enrolled in this class".to_string(),
        }
    }

    pub fn capacity_exceeded() -> Error {
        Error::CapacityExceeded {
            message: "Class is at full capacity".to_string(),
        }
    }

    pub fn schedule_conflict(day_of_week: i32, start_time: &str) -> Error {
        Error::ScheduleConflict {
            message: format!(
                "Time conflict: Another class is already scheduled at {} on day {}",
                start_time, day_of_week
            ),
        }
    }

    pub fn code_taken(code: &str) -> Error {
        Error::Conflict {
            message: format!("Attendance code {} is already in use, try again", code),
        }
    }

    pub fn already_marked() -> Error {
        Error::AlreadyMarked {
            message: "Attendance already recorded for this session".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::InternalError {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::InternalError {
            kind: "MigrationError",
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::InternalError {
            kind: "IdentityProviderError",
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InternalError {
            kind: "UrlError",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}
