use thiserror::Error;

/// Redis 操作错误
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("Redis 配置错误: {message}")]
    ConfigError { message: String },

    #[error("Redis 连接失败: {message}")]
    ConnectionError { message: String },

    #[error("发布失败: {message}")]
    PublishError { message: String },

    #[error("订阅失败: {message}")]
    SubscribeError { message: String },

    #[error("序列化失败: {message}")]
    SerializationError { message: String },
}

pub type RedisResult<T> = Result<T, RedisError>;
