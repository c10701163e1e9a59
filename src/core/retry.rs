//! 重试策略：有界指数退避
//!
//! 包裹任意易瞬时失败的异步操作（邮件、搜索、模型调用）。是否可重试由调用方谓词决定，
//! 不可重试的错误立即短路，不消耗重试预算。

use std::future::Future;
use std::time::Duration;

use crate::core::AssistantError;

/// 指数退避参数；`max_retries` 为总尝试次数（与原始系统一致）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_delay_ms,
            backoff_multiplier,
        }
    }

    /// 第 attempt 次（从 1 起）失败后的等待时长：initial * multiplier^(attempt-1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_delay_ms as f64 * factor) as u64)
    }

    /// 以默认判定（仅 TransientIo 可重试）执行操作
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, AssistantError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AssistantError>>,
    {
        self.run_if(op_name, AssistantError::is_retryable, op).await
    }

    /// 以调用方谓词执行操作：谓词为假立即返回错误，为真则退避后重试，预算耗尽返回最后一次错误
    pub async fn run_if<T, F, Fut, P>(
        &self,
        op_name: &str,
        retryable: P,
        mut op: F,
    ) -> Result<T, AssistantError>
    where
        P: Fn(&AssistantError) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AssistantError>>,
    {
        let budget = self.max_retries.max(1);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(op = op_name, attempt, "recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !retryable(&err) => {
                    tracing::debug!(op = op_name, error = %err, "not retryable, giving up");
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= budget {
                        tracing::warn!(op = op_name, attempts = attempt, error = %err, "retry budget exhausted");
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
