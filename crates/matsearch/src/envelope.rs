use axum::extract::rejection::BytesRejection;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use matsearch_core::Error;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    MethodNotAllowed,
    MissingCredentials,
    CompletionFailed,
    UnexpectedError,
}

impl ErrorCode {
    pub fn of(e: &Error) -> Self {
        match e {
            Error::InvalidRequest(_) => Self::InvalidRequest,
            Error::MethodNotAllowed => Self::MethodNotAllowed,
            Error::MissingCredentials(_) => Self::MissingCredentials,
            Error::Completion(_) | Error::EmptyCompletion => Self::CompletionFailed,
            // Search and telemetry failures are absorbed before reaching here.
            Error::Search(_) | Error::NotConfigured(_) | Error::Telemetry(_) => {
                Self::UnexpectedError
            }
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingCredentials | Self::CompletionFailed | Self::UnexpectedError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn from_error(e: &Error) -> Self {
        let error = e.to_string();
        Self {
            error: if error.trim().is_empty() {
                "檢索失敗".to_string()
            } else {
                error
            },
        }
    }
}

/// `{ "error": "..." }` with the status for `e`; 405 also carries `Allow: POST`.
pub fn error_response(e: &Error) -> Response {
    let code = ErrorCode::of(e);
    let body = Json(ErrorBody::from_error(e));
    if code == ErrorCode::MethodNotAllowed {
        return (code.status(), [(header::ALLOW, "POST")], body).into_response();
    }
    (code.status(), body).into_response()
}

/// A body that could not be buffered (too large, or the stream broke) still gets the
/// `{ "error": "..." }` shape, with the rejection's own status.
pub fn rejection_response(rej: &BytesRejection) -> Response {
    let status = rej.status();
    let error = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "Request body too large".to_string()
    } else {
        rej.body_text()
    };
    tracing::warn!(status = status.as_u16(), error = %error, "request body rejected");
    (status, Json(ErrorBody { error })).into_response()
}
