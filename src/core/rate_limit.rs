//! 速率限制：按能力名的滑动窗口预算
//!
//! 每个能力维护窗口内的调用时间戳；仅当窗口内数量低于预算时放行并记录。
//! 拒绝不是错误（也不记录时间戳），由调用方决定排队、失败还是降级。
//! 全部状态在一把锁内变更，并发调用不会超发。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// 单个能力的窗口预算
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub max_calls: usize,
    pub window: Duration,
}

impl Budget {
    pub fn new(max_calls: usize, window_secs: u64) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(window_secs),
        }
    }
}

struct CapabilityWindow {
    budget: Budget,
    calls: VecDeque<Instant>,
}

impl CapabilityWindow {
    /// 丢弃已滑出窗口的时间戳
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) > self.budget.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 滑动窗口限流器；未注册预算的能力不设限
pub struct RateLimiter {
    windows: Mutex<HashMap<String, CapabilityWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_budget(mut self, capability: impl Into<String>, budget: Budget) -> Self {
        self.windows.get_mut().insert(
            capability.into(),
            CapabilityWindow {
                budget,
                calls: VecDeque::new(),
            },
        );
        self
    }

    /// 尝试获取一次调用额度：窗口未满则记录并放行，否则拒绝且不记录
    pub async fn try_acquire(&self, capability: &str) -> bool {
        let mut windows = self.windows.lock().await;
        let Some(window) = windows.get_mut(capability) else {
            return true;
        };
        let now = Instant::now();
        window.prune(now);
        if window.calls.len() < window.budget.max_calls {
            window.calls.push_back(now);
            true
        } else {
            tracing::warn!(
                capability,
                max_calls = window.budget.max_calls,
                window_secs = window.budget.window.as_secs(),
                "rate limit denied"
            );
            false
        }
    }

    /// 窗口已满时距最旧一次调用滑出窗口还需等待多久；未满或未注册返回 None
    pub async fn retry_after(&self, capability: &str) -> Option<Duration> {
        let mut windows = self.windows.lock().await;
        let window = windows.get_mut(capability)?;
        let now = Instant::now();
        window.prune(now);
        if window.calls.len() < window.budget.max_calls {
            return None;
        }
        window
            .calls
            .front()
            .map(|oldest| window.budget.window.saturating_sub(now.duration_since(*oldest)))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_budget_then_denies() {
        let limiter = RateLimiter::new().with_budget("search", Budget::new(3, 60));
        for _ in 0..3 {
            assert!(limiter.try_acquire("search").await);
        }
        assert!(!limiter.try_acquire("search").await);
    }

    #[tokio::test]
    async fn test_unregistered_capability_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.try_acquire("anything").await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new().with_budget("mail", Budget::new(2, 10));
        assert!(limiter.try_acquire("mail").await);
        assert!(limiter.try_acquire("mail").await);
        assert!(!limiter.try_acquire("mail").await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.try_acquire("mail").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_does_not_consume_budget() {
        let limiter = RateLimiter::new().with_budget("llm", Budget::new(1, 10));
        assert!(limiter.try_acquire("llm").await);

        tokio::time::advance(Duration::from_secs(5)).await;
        // 被拒绝的调用不得写入窗口，否则后面这次就会被挤掉
        assert!(!limiter.try_acquire("llm").await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire("llm").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_oldest_call() {
        let limiter = RateLimiter::new().with_budget("search", Budget::new(1, 60));
        assert!(limiter.retry_after("search").await.is_none());

        assert!(limiter.try_acquire("search").await);
        assert_eq!(
            limiter.retry_after("search").await,
            Some(Duration::from_secs(60))
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(
            limiter.retry_after("search").await,
            Some(Duration::from_secs(40))
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_budget() {
        let limiter = Arc::new(RateLimiter::new().with_budget("store", Budget::new(5, 60)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(
                async move { limiter.try_acquire("store").await },
            ));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
