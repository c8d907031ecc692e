use thiserror::Error;

use crate::providers::ProviderType;

/// Error taxonomy shared by the client, loader, and every transport driver.
///
/// Drivers wrap these in `anyhow::Error`; callers that need to branch on the
/// kind downcast with `err.downcast_ref::<UtcpError>()`.
#[derive(Error, Debug)]
pub enum UtcpError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Provider type mismatch: expected {expected:?}, got {actual:?}")]
    TransportMismatch {
        expected: ProviderType,
        actual: ProviderType,
    },

    #[error("Security violation: {0}")]
    Security(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),
}

impl UtcpError {
    /// Typed mismatch error for drivers handed the wrong provider variant.
    pub fn mismatch(expected: ProviderType, actual: ProviderType) -> anyhow::Error {
        UtcpError::TransportMismatch { expected, actual }.into()
    }
}
