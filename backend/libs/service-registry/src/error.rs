use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned {status} for {operation}: {body}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid registry URL: {0}")]
    InvalidUrl(String),
}

impl RegistryError {
    /// Connection problems and 5xx replies are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            RegistryError::UnexpectedStatus { status, .. } => *status >= 500,
            RegistryError::InvalidUrl(_) => false,
        }
    }
}
