use std::fmt;

/// Non-success response from the cache service or blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequestError {
    pub status_code: u16,
    pub body: Option<String>,
}

impl ServiceRequestError {
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            status_code,
            body: if body.is_empty() { None } else { Some(body) },
        }
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable_status(self.status_code)
    }
}

impl fmt::Display for ServiceRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "HTTP {} - {}", self.status_code, body),
            None => {
                let reason = reqwest::StatusCode::from_u16(self.status_code)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .unwrap_or("Unknown error");
                write!(f, "HTTP {} - {}", self.status_code, reason)
            }
        }
    }
}

impl std::error::Error for ServiceRequestError {}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache service request failed: {0}")]
    ServiceRequest(#[from] ServiceRequestError),

    #[error("Chunk at offset {offset} returned {actual} bytes, expected {expected}")]
    SizeMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("{operation} response is missing required field '{field}'")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[error("{operation} was rejected by the cache service")]
    NotOk { operation: &'static str },

    #[error("Cache entry was produced by a different protocol client")]
    EntryMismatch,
}

pub(crate) fn is_retryable_status(status_code: u16) -> bool {
    (500..600).contains(&status_code) || status_code == 408 || status_code == 429
}

pub(crate) fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    match err.status() {
        Some(status) => is_retryable_status(status.as_u16()),
        None => false,
    }
}

/// Walks an error chain and decides whether the failure is worth retrying.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(service) = cause.downcast_ref::<ServiceRequestError>() {
            return service.is_retryable();
        }
        if let Some(CacheError::ServiceRequest(service)) = cause.downcast_ref::<CacheError>() {
            return service.is_retryable();
        }
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            return is_retryable_reqwest_error(reqwest_err);
        }
        false
    })
}
