//! Error taxonomy for the thread scanner.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    #[error("Read of {size:#x} bytes at {address:#x} failed")]
    ReadFailed { address: u64, size: usize },

    #[error("Context unavailable for TID {tid}: {reason}")]
    ContextUnavailable { tid: u32, reason: String },

    #[error("Thread not found: {0}")]
    ThreadNotFound(u32),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Memory query failed at {address:#x}")]
    QueryFailed { address: u64 },

    #[error("Invalid scan options: {0}")]
    InvalidOptions(&'static str),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
