//! 领域错误定义

use thiserror::Error;

/// 领域层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 线路消息编解码错误
    #[error("编解码失败: {message}")]
    Encoding { message: String },

    /// 频道名无法解析
    #[error("无法解析的频道名: {channel}")]
    UnparseableChannel { channel: String },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

/// 仓储（外部协作者）错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("resource not found")]
    NotFound,

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
