//! HTTP 错误类型及领域错误的转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::config::EXHAUSTED_RETRY_AFTER_SECS;
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// 未知、过期、未确认或已消费的取件码统一使用的提示。
pub const INVALID_CODE_MESSAGE: &str = "invalid or expired code";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge(u64),
    RangeNotSatisfiable(u64),
    BadGateway(String),
    ServiceUnavailable {
        message: String,
        retry_after: Option<u64>,
    },
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Conflict(msg)
            | ApiError::BadGateway(msg)
            | ApiError::Internal(msg) => (status, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => {
                (status, format!("object exceeds {limit} bytes")).into_response()
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (status, headers, "range not satisfiable").into_response()
            }
            ApiError::ServiceUnavailable {
                message,
                retry_after,
            } => {
                let mut headers = HeaderMap::new();
                if let Some(secs) = retry_after
                    && let Ok(value) = HeaderValue::from_str(&secs.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (status, headers, message).into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(key) => ApiError::BadRequest(format!("invalid key: {key}")),
            StorageError::NotFound(_) => ApiError::NotFound("object not found".into()),
            StorageError::AlreadyExists(_) => ApiError::Conflict("object already uploaded".into()),
            StorageError::TooLarge(limit) => ApiError::PayloadTooLarge(limit),
            StorageError::Backend(msg) => {
                error!(error = %msg, "storage backend failure");
                ApiError::BadGateway("storage backend unavailable".into())
            }
            StorageError::Io(err) => {
                error!(error = %err, "storage io failure");
                ApiError::Internal("storage failure".into())
            }
            StorageError::Config(msg) => {
                error!(error = %msg, "storage misconfigured");
                ApiError::Internal("storage failure".into())
            }
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Validation(msg) => ApiError::BadRequest(msg),
            TransferError::CodeSpaceExhausted { .. } => ApiError::ServiceUnavailable {
                message: "no pickup code available, retry shortly".into(),
                retry_after: Some(EXHAUSTED_RETRY_AFTER_SECS),
            },
            TransferError::InvalidOrExpiredCode => ApiError::NotFound(INVALID_CODE_MESSAGE.into()),
            TransferError::Storage(err) => {
                error!(error = %err, "storage gateway failure");
                ApiError::BadGateway("storage backend unavailable".into())
            }
            TransferError::SessionStore(err) => {
                warn!(error = %err, "session store failure");
                ApiError::ServiceUnavailable {
                    message: "session store unavailable".into(),
                    retry_after: None,
                }
            }
            TransferError::Misconfigured(msg) => {
                error!(reason = %msg, "transfer policy misconfigured");
                ApiError::Internal("server misconfigured".into())
            }
        }
    }
}
