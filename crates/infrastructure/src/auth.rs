//! 会话令牌校验
//!
//! 实时层不签发长效令牌（签发属于被排除的认证路径），只做校验：
//! 验签、签发者/受众集合匹配、过期，以及可选的吊销检查。凭证里
//! 带 `jti` 时查询 `blacklist:<jti>`，命中即无条件拒绝，与剩余
//! 有效期无关。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use domain::UserId;

/// 黑名单键前缀
const BLACKLIST_KEY_PREFIX: &str = "blacklist:";

/// JWT Claims 结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// 用户 id（十进制字符串）
    pub sub: String,
    pub iss: String,
    pub aud: String,
    /// 过期时间 (Unix timestamp)
    pub exp: i64,
    /// 吊销 id，可选
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// 认证错误
///
/// 对外统一表现为"authorization failed"，绝不静默降级为匿名。
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("invalid or expired ticket")]
    InvalidTicket,

    #[error("authorization required")]
    MissingCredentials,

    #[error("internal auth error: {0}")]
    Internal(String),
}

/// 令牌黑名单存储
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// 吊销一个 jti，保留到令牌自身过期为止
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), AuthError>;

    /// jti 是否已被吊销
    async fn is_revoked(&self, jti: &str) -> Result<bool, AuthError>;
}

fn blacklist_key(jti: &str) -> String {
    format!("{}{}", BLACKLIST_KEY_PREFIX, jti)
}

/// Redis 黑名单存储
#[derive(Clone)]
pub struct RedisBlacklist {
    conn: ConnectionManager,
}

impl RedisBlacklist {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BlacklistStore for RedisBlacklist {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), AuthError> {
        let ttl = (expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            warn!(jti, "令牌已过期，跳过黑名单写入");
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(blacklist_key(jti))
            .arg(ttl)
            .arg("1")
            .query_async(&mut conn)
            .await
            .map_err(|e| AuthError::Internal(format!("Failed to add token to blacklist: {}", e)))?;

        info!(jti, ttl, "令牌已加入黑名单");
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, AuthError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(blacklist_key(jti))
            .query_async(&mut conn)
            .await
            .map_err(|e| AuthError::Internal(format!("Failed to check blacklist: {}", e)))?;

        Ok(exists)
    }
}

/// 内存黑名单存储（用于测试）
#[derive(Default)]
pub struct InMemoryBlacklist {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        entries.retain(|_, expires_at| *expires_at > now);
    }
}

#[async_trait]
impl BlacklistStore for InMemoryBlacklist {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), AuthError> {
        self.cleanup().await;
        let mut entries = self.entries.write().await;
        entries.insert(jti.to_string(), expires_at);
        debug!(jti, "令牌已加入内存黑名单");
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, AuthError> {
        self.cleanup().await;
        let entries = self.entries.read().await;
        Ok(entries.contains_key(jti))
    }
}

/// 会话令牌校验器
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    blacklist: std::sync::Arc<dyn BlacklistStore>,
}

impl TokenVerifier {
    pub fn new(jwt: &config::JwtConfig, blacklist: std::sync::Arc<dyn BlacklistStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&jwt.issuers);
        validation.set_audience(&jwt.audiences);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(jwt.secret.as_bytes()),
            validation,
            blacklist,
        }
    }

    /// 校验令牌并解析出身份
    ///
    /// 验签、签发者、受众、过期全部通过后再查吊销；黑名单命中
    /// 一律拒绝。后续流程只使用这里解析出的身份，不自行二次推导。
    pub async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims = data.claims;

        if let Some(jti) = claims.jti.as_deref() {
            if !jti.is_empty() {
                match self.blacklist.is_revoked(jti).await {
                    Ok(true) => return Err(AuthError::TokenRevoked),
                    Ok(false) => {}
                    Err(err) => {
                        // 黑名单存储不可达时沿用令牌自身的有效性判断
                        warn!(error = %err, "黑名单查询失败，跳过吊销检查");
                    }
                }
            }
        }

        let user_id = claims
            .sub
            .parse::<u64>()
            .map_err(|_| AuthError::InvalidToken)?;

        debug!(user_id, "令牌校验通过");
        Ok(UserId(user_id))
    }
}
