use thiserror::Error;

/// 注册表错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// 服务器总连接数达到上限
    #[error("server connection limit reached")]
    ServerConnectionLimit,

    /// 单用户连接数达到上限
    #[error("user connection limit reached")]
    UserConnectionLimit,

    /// 注册表已进入关闭流程，不再接受新注册
    #[error("registry is shutting down")]
    ShuttingDown,
}
