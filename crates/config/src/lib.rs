//! 统一配置中心
//!
//! 提供实时层的全局配置管理，包括：
//! - 服务监听
//! - Redis 共享存储
//! - JWT 认证与 WebSocket 票据
//! - 限流策略

use serde::{Deserialize, Serialize};
use std::env;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// Redis 配置
    pub redis: RedisConfig,
    /// JWT 认证配置
    pub jwt: JwtConfig,
    /// WebSocket 票据配置
    pub ticket: TicketConfig,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// 为空时实时层退化为单实例模式（不做跨实例扇出）
    pub url: Option<String>,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    /// 接受的签发者集合
    pub issuers: Vec<String>,
    /// 接受的受众集合
    pub audiences: Vec<String>,
}

/// WebSocket 票据配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketConfig {
    /// 票据存活时间（秒），过期即失效
    pub ttl_seconds: u64,
}

/// 限流配置
///
/// `enforce` 为 false 时所有限流检查无条件放行。该开关只由
/// APP_ENV 显式推导（test / development / stress），绝不隐式推断。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enforce: bool,
}

impl AppConfig {
    /// 从环境变量加载配置
    /// 对于关键安全配置（JWT_SECRET），如果环境变量不存在将会 panic
    /// 这确保了生产环境中不会使用不安全的默认值
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8080),
            },
            redis: RedisConfig {
                url: Some(
                    env::var("REDIS_URL")
                        .expect("REDIS_URL environment variable is required for production safety"),
                ),
                reconnect_interval_ms: env::var("REDIS_RECONNECT_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
                max_reconnect_attempts: env::var("REDIS_MAX_RECONNECT_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .expect("JWT_SECRET environment variable is required for production safety"),
                issuers: list_from_env("JWT_ISSUERS", &["pulse-api", "pulse-admin"]),
                audiences: list_from_env("JWT_AUDIENCES", &["pulse-client", "pulse-mobile"]),
            },
            ticket: TicketConfig {
                ttl_seconds: env::var("WS_TICKET_TTL_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            },
            rate_limit: RateLimitConfig {
                enforce: rate_limit_enforced(),
            },
        }
    }

    /// 从环境变量加载配置，开发环境版本
    /// 提供不安全的默认值，仅用于测试和开发
    pub fn from_env_with_defaults() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8080),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok(),
                reconnect_interval_ms: 500,
                max_reconnect_attempts: 5,
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET").unwrap_or_else(|_| {
                    "dev-secret-key-not-for-production-use-minimum-32-chars".to_string()
                }),
                issuers: list_from_env("JWT_ISSUERS", &["pulse-api", "pulse-admin"]),
                audiences: list_from_env("JWT_AUDIENCES", &["pulse-client", "pulse-mobile"]),
            },
            ticket: TicketConfig {
                ttl_seconds: env::var("WS_TICKET_TTL_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            },
            rate_limit: RateLimitConfig {
                enforce: rate_limit_enforced(),
            },
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证JWT密钥长度（至少256位/32字节）
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        // 检查JWT密钥是否为明显的开发密钥
        if self.jwt.secret.contains("dev-secret")
            || self.jwt.secret.contains("not-for-production")
            || self.jwt.secret.contains("please-change")
        {
            return Err(ConfigError::InvalidJwtSecret(
                "Cannot use development JWT secret in production".to_string(),
            ));
        }

        if self.jwt.issuers.is_empty() || self.jwt.audiences.is_empty() {
            return Err(ConfigError::InvalidJwtConfig(
                "At least one accepted issuer and audience is required".to_string(),
            ));
        }

        if self.ticket.ttl_seconds == 0 {
            return Err(ConfigError::InvalidTicketConfig(
                "Ticket TTL must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// 从逗号分隔的环境变量读取列表，未设置时使用默认值
fn list_from_env(key: &str, defaults: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

/// 限流是否启用：test / development / stress 环境显式关闭
fn rate_limit_enforced() -> bool {
    let env_name = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
    !matches!(env_name.as_str(), "test" | "development" | "stress")
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid JWT configuration: {0}")]
    InvalidJwtConfig(String),
    #[error("Invalid ticket configuration: {0}")]
    InvalidTicketConfig(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),
}

impl Default for AppConfig {
    /// 默认配置使用开发环境版本
    /// 注意：生产环境应该明确调用 from_env() 而不是依赖默认值
    fn default() -> Self {
        Self::from_env_with_defaults()
    }
}
