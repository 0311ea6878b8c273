use latchkey_engine::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("could not encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    /// No usable token pair; the operator has to log in again
    #[error("session expired, log in again")]
    SessionExpired,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {message}")]
    Deserialization { message: String, body: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<ApiError> for StoreError {
    fn from(err: ApiError) -> Self {
        match err.status() {
            Some(409) => StoreError::Conflict,
            Some(401 | 403) => StoreError::Unauthorized(err.to_string()),
            Some(500..) => StoreError::Unavailable(err.to_string()),
            Some(_) => StoreError::Rejected(err.to_string()),
            None => match err {
                ApiError::SessionExpired => StoreError::Unauthorized(err.to_string()),
                ApiError::Transport(_) => StoreError::Unavailable(err.to_string()),
                _ => StoreError::Rejected(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ApiError {
        ApiError::Status { status, body: String::new() }
    }

    #[test]
    fn maps_status_codes_to_store_errors() {
        assert!(matches!(StoreError::from(status(409)), StoreError::Conflict));
        assert!(matches!(StoreError::from(status(401)), StoreError::Unauthorized(_)));
        assert!(matches!(StoreError::from(status(503)), StoreError::Unavailable(_)));
        assert!(matches!(StoreError::from(status(400)), StoreError::Rejected(_)));
        assert!(matches!(
            StoreError::from(ApiError::SessionExpired),
            StoreError::Unauthorized(_)
        ));
    }
}
