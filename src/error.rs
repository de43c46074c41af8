use crate::session::SessionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("No scan record received yet for citizen id {0}")]
    CardNotReceived(String),

    #[error("Scan belongs to citizen id {scanned}, expected {expected}")]
    IdentityMismatch { expected: String, scanned: String },

    #[error("Attendance cannot be confirmed in state {0}")]
    NotVerified(SessionState),

    #[error("Cannot {action} in state {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VerifyError>;
