use thiserror::Error;

/// Crate-wide error type. Variants are grouped to match the startup-fatal /
/// runtime-fatal taxonomy: a `Validation` or `Verbs`/`Registration`/`Ring`
/// error surfaced from `main` is always startup-fatal; `Io` and the runtime
/// variants under `Ring`/`Verbs` can also occur after the worker has started.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("NIC verbs error: {0}")]
    Verbs(String),

    #[error("memory registration error: {0}")]
    Registration(String),

    #[error("ring producer error: {0}")]
    Ring(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
