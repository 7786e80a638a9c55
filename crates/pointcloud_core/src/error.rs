use thiserror::Error;

#[derive(Debug, Error)]
pub enum PointCloudError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("schema error: {message}")]
    Schema { message: String },
    #[error("integrity violation: {message}")]
    Integrity { message: String },
}

impl PointCloudError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

pub type PointCloudResult<T> = Result<T, PointCloudError>;

impl From<rusqlite::Error> for PointCloudError {
    fn from(value: rusqlite::Error) -> Self {
        PointCloudError::storage(value.to_string())
    }
}

impl From<std::io::Error> for PointCloudError {
    fn from(value: std::io::Error) -> Self {
        PointCloudError::storage(format!("io: {value}"))
    }
}
