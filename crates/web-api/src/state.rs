use std::sync::Arc;

use application::{ChatHub, Hub};
use domain::{BlockList, Membership, MessageStore, UserDirectory};
use infrastructure::{Notifier, RateLimiter, TicketStore, TokenVerifier};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub chat_hub: Arc<ChatHub>,
    /// None 表示单实例模式：不做跨实例扇出
    pub notifier: Option<Notifier>,
    pub tickets: Arc<dyn TicketStore>,
    pub token_verifier: Arc<TokenVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub messages: Arc<dyn MessageStore>,
    pub blocks: Arc<dyn BlockList>,
    pub membership: Arc<dyn Membership>,
    pub users: Arc<dyn UserDirectory>,
    pub ticket_ttl_seconds: u64,
}
