//! Auth error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid users file: {0}")]
    InvalidConfig(String),
    #[error("invalid CIDR entry '{entry}': {reason}")]
    InvalidCidr { entry: String, reason: String },
    #[error("duplicate username after case-fold: '{0}'")]
    DuplicateUser(String),
}
