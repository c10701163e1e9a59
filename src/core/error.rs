//! 助理错误类型
//!
//! 全部错误收敛为一个枚举：`#[error]` 文案即对外的脱敏消息，
//! 内部细节由产生处用 tracing 记录。重试判定（is_retryable）供 RetryPolicy 使用。

use thiserror::Error;

/// 编排层运行过程中可能出现的错误（输入校验、资源池、限流、外部 IO、鉴权）
#[derive(Error, Debug)]
pub enum AssistantError {
    /// 输入不合法，指明出错字段；永不重试
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// 资源池已满且等待超时；属于降级而非崩溃
    #[error("The {resource} service is busy right now, please try again shortly")]
    PoolExhausted { resource: &'static str },

    /// 能力调用超出窗口预算；附带建议的重试等待
    #[error("Rate limit reached for {capability}, retry in about {retry_after_secs}s")]
    RateLimited {
        capability: String,
        retry_after_secs: u64,
    },

    /// 瞬时网络 / IO 失败；由 RetryPolicy 重试，重试耗尽后才上抛
    #[error("A network operation failed: {0}")]
    TransientIo(String),

    /// 上游鉴权失败；永不重试，属于配置问题
    #[error("Upstream rejected our credentials: {0}")]
    UpstreamAuth(String),

    /// 内部缺陷（序列化、不变量被破坏等）；对外只给出笼统提示
    #[error("Internal error, the details have been logged")]
    Internal(String),
}

impl AssistantError {
    /// 默认重试判定：仅瞬时 IO 可重试，其余全部短路
    pub fn is_retryable(&self) -> bool {
        matches!(self, AssistantError::TransientIo(_))
    }

    /// 越过编排器边界的用户可见文案（即 Display；Internal 不携带细节）
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// 便捷构造：输入校验失败
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AssistantError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_io_is_retryable() {
        assert!(AssistantError::TransientIo("reset".into()).is_retryable());
        assert!(!AssistantError::validation("query", "empty").is_retryable());
        assert!(!AssistantError::UpstreamAuth("401".into()).is_retryable());
        assert!(!AssistantError::PoolExhausted { resource: "store" }.is_retryable());
        assert!(!AssistantError::RateLimited {
            capability: "search".into(),
            retry_after_secs: 30,
        }
        .is_retryable());
    }

    #[test]
    fn test_internal_message_is_sanitized() {
        let err = AssistantError::Internal("row 42 had NULL due_date".into());
        assert!(!err.user_message().contains("due_date"));
    }

    #[test]
    fn test_validation_names_field() {
        let err = AssistantError::validation("user_id", "must not be empty");
        assert!(err.user_message().contains("user_id"));
    }
}
