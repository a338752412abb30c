//! 存储错误类型

use thiserror::Error;

/// 存储后端与事件/注册表存储的错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Unsupported data folder: {0}")]
    InvalidFolder(String),
}
