//! 重连退避
//!
//! 延迟按 `min(cap, base * 2^attempt)` 增长，并叠加最多 10% 的
//! 随机抖动，避免大量客户端在服务端恢复瞬间同步重连。连接成功
//! 打开后计数归零。

use std::time::Duration;

use rand::Rng;

/// 重连策略参数
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// 抖动上限，按已计算延迟的比例（0.1 = 最多 10%）
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter_ratio: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重试的确定性延迟（不含抖动）
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// 叠加抖动后的实际延迟
    pub fn jittered_delay_at(&self, attempt: u32) -> Duration {
        let delay = self.delay_at(attempt);
        let jitter = delay.mul_f64(rand::rng().random_range(0.0..=self.jitter_ratio));
        delay + jitter
    }
}

/// 连接尝试计数器
#[derive(Debug, Default)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// 下一次重试前应等待的时长；每次调用推进计数
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.jittered_delay_at(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// 连接成功打开后归零
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
