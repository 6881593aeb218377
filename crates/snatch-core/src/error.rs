use thiserror::Error;

pub type SnatchResult<T> = Result<T, SnatchError>;

/// Error kinds per the propagation policy: the snatch loop recovers from
/// `Capacity`/`Transient` indefinitely; every other kind is terminal for the
/// operation that raised it.
#[derive(Debug, Error)]
pub enum SnatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("provider out of capacity: {0}")]
    Capacity(String),

    #[error("provider transient error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Permanent(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SnatchError {
    /// HTTP status class per §7. Used by the HTTP surface to translate
    /// domain errors into responses without the handlers re-deriving it.
    pub fn status_code(&self) -> u16 {
        match self {
            SnatchError::Validation(_) => 400,
            SnatchError::Auth(_) => 401,
            SnatchError::Capacity(_) | SnatchError::Transient(_) | SnatchError::Permanent(_) => {
                502
            }
            SnatchError::Data(_) => 422,
            SnatchError::Infrastructure(_) => 503,
            SnatchError::Credential(_) | SnatchError::Proxy(_) | SnatchError::Unreachable(_) => {
                502
            }
            SnatchError::Io(_) | SnatchError::Other(_) => 500,
        }
    }
}

/// Classify a provider (OCI) service error per the union rule in §4.5/§9(c):
/// any of status 429, a code containing `TooManyRequests`/`LimitExceeded`, or
/// a message containing `Out of host capacity` is capacity, non-terminal.
pub fn classify_service_error(status: u16, code: &str, message: &str) -> SnatchError {
    if status == 429
        || code.contains("TooManyRequests")
        || code.contains("LimitExceeded")
        || message.contains("Out of host capacity")
    {
        SnatchError::Capacity(format!("{code}: {message}"))
    } else if status >= 500 {
        SnatchError::Transient(format!("{code}: {message}"))
    } else {
        SnatchError::Permanent(format!("{code}: {message}"))
    }
}
