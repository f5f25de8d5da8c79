use serde::{Deserialize, Serialize};

use crate::ordering::OrderingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    NotAuthorized,
    Integrity,
    Persistence,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<OrderingError> for ApiError {
    fn from(value: OrderingError) -> Self {
        let code = match value {
            OrderingError::NotFound { .. } => ErrorCode::NotFound,
            OrderingError::UnknownId { .. }
            | OrderingError::DuplicateId { .. }
            | OrderingError::MissingId { .. } => ErrorCode::Integrity,
        };
        Self::new(code, value.to_string())
    }
}
