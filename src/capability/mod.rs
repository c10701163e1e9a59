//! 能力处理器与注册表
//!
//! 每个意图标签对应一个处理器；处理器自带所需的协作者（池、缓存、存储），
//! 声明自己的限流能力键，执行后返回给用户的文本回复。编排器按标签查表分发，
//! 启动时校验注册表覆盖了全部标签。

pub mod calendar;
pub mod knowledge;
pub mod mail;
pub mod query;
pub mod search;
pub mod summary;
pub mod tasks;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AssistantError, PooledHandle, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{HistoryStore, StoreConn};

pub use calendar::ScheduleMeetingHandler;
pub use knowledge::KnowledgeLookupHandler;
pub use mail::{CheckMailHandler, SendMailHandler};
pub use query::{validate_sql, RunQueryHandler};
pub use search::WebSearchHandler;
pub use summary::{DailySummaryJob, RescheduleSummaryHandler};
pub use tasks::{AddTaskHandler, ListTasksHandler, TaskInsightsHandler};

/// 一个意图的执行器
#[async_trait]
pub trait Handler: Send + Sync {
    /// 处理的意图标签
    fn kind(&self) -> IntentKind;

    /// 占用的限流能力键；None 表示不占预算
    fn capability(&self) -> Option<&'static str> {
        None
    }

    /// 执行意图，返回用户可读的回复
    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError>;
}

/// 标签到处理器的查表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<IntentKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: IntentKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    /// 启动时校验：每个标签都得有处理器，缺一个就拒绝启动
    pub fn ensure_complete(&self) -> Result<(), AssistantError> {
        let missing: Vec<&str> = IntentKind::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .map(|kind| kind.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AssistantError::Internal(format!(
                "no handler registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

/// 兜底处理器：列出助理能做什么
pub struct UnclassifiedHandler;

#[async_trait]
impl Handler for UnclassifiedHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::Unclassified
    }

    async fn execute(&self, _user_id: &str, _intent: &Intent) -> Result<String, AssistantError> {
        Ok("I couldn't map that to something I can do. Try one of:\n\
            - \"check mail\" or \"send an email to alice@example.com subject: ... body: ...\"\n\
            - \"add task: buy milk due tomorrow\", \"list tasks\" or \"task insights\"\n\
            - \"schedule a meeting with bob@example.com at 3 pm on monday\"\n\
            - \"search for ...\" or a raw SELECT / INSERT / UPDATE / DELETE statement\n\
            - \"reschedule the summary to 7:00 am\"\n\
            - \"who are you\" for a note about this assistant"
            .to_string())
    }
}

/// 处理器拿到别的标签属于内部缺陷
pub(crate) fn mismatched(kind: IntentKind) -> AssistantError {
    AssistantError::Internal(format!(
        "handler for {} received a different intent",
        kind.as_str()
    ))
}

/// 瞬时失败说明句柄可能已坏，不回池；其余错误句柄无恙，照常归还
pub(crate) fn release_after_error<T: Send + 'static>(
    handle: PooledHandle<T>,
    err: &AssistantError,
) {
    if err.is_retryable() {
        handle.discard();
    }
}

/// 尽力而为的历史记录：拿不到连接或写入失败都只告警，回复照常返回
pub(crate) async fn record_history(
    pool: &Arc<ResourcePool<Box<dyn StoreConn>>>,
    history: &Arc<dyn HistoryStore>,
    user_id: &str,
    request: &str,
    reply: &str,
) {
    match pool.acquire().await {
        Ok(mut conn) => {
            if let Err(err) = history.record(&mut **conn, user_id, request, reply) {
                tracing::warn!(error = %err, "failed to record history");
                release_after_error(conn, &err);
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "no store connection for history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler {
        kind: IntentKind,
    }

    #[async_trait]
    impl Handler for NoopHandler {
        fn kind(&self) -> IntentKind {
            self.kind
        }

        async fn execute(&self, _user_id: &str, _intent: &Intent) -> Result<String, AssistantError> {
            Ok("ok".to_string())
        }
    }

    #[test]
    fn test_registry_reports_missing_kinds() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler {
            kind: IntentKind::CheckMail,
        }));

        let err = registry.ensure_complete().unwrap_err();
        let AssistantError::Internal(detail) = err else {
            panic!("expected Internal");
        };
        assert!(detail.contains("send_mail"));
        assert!(!detail.contains("check_mail"));
    }

    #[test]
    fn test_registry_complete_when_all_kinds_registered() {
        let mut registry = HandlerRegistry::new();
        for kind in IntentKind::ALL {
            registry.register(Arc::new(NoopHandler { kind }));
        }
        assert!(registry.ensure_complete().is_ok());
        assert!(registry.get(IntentKind::RunQuery).is_some());
    }

    #[tokio::test]
    async fn test_unclassified_reply_lists_commands() {
        let reply = UnclassifiedHandler
            .execute("u1", &Intent::Unclassified)
            .await
            .unwrap();
        assert!(reply.contains("check mail"));
        assert!(reply.contains("schedule a meeting"));
    }
}
