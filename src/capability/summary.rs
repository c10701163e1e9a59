//! 每日摘要：定时汇总收件箱与待办并发给自己
//!
//! 摘要必须是新鲜数据，绕过收件箱缓存直接拉取。改点处理器只动调度器，
//! 不碰任何外部资源。

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::mail::fetch_inbox_summary;
use crate::capability::tasks::format_task_lines;
use crate::capability::{mismatched, release_after_error, Handler};
use crate::core::{AssistantError, DailyScheduler, JobHandler, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{MailSession, StoreConn, TaskStore};

pub const DAILY_SUMMARY_JOB: &str = "daily_summary";

/// 定时任务本体
pub struct DailySummaryJob {
    mail_pool: Arc<ResourcePool<Box<dyn MailSession>>>,
    store_pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    tasks: Arc<dyn TaskStore>,
    user_id: String,
    self_address: String,
    recent_limit: usize,
}

impl DailySummaryJob {
    pub fn new(
        mail_pool: Arc<ResourcePool<Box<dyn MailSession>>>,
        store_pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
        tasks: Arc<dyn TaskStore>,
        user_id: String,
        self_address: String,
        recent_limit: usize,
    ) -> Self {
        Self {
            mail_pool,
            store_pool,
            tasks,
            user_id,
            self_address,
            recent_limit,
        }
    }
}

#[async_trait]
impl JobHandler for DailySummaryJob {
    fn name(&self) -> &str {
        DAILY_SUMMARY_JOB
    }

    async fn run(&self) -> Result<(), AssistantError> {
        let inbox = fetch_inbox_summary(&self.mail_pool, self.recent_limit).await?;

        let task_lines = {
            let mut conn = self.store_pool.acquire().await?;
            match self.tasks.pending(&mut **conn, &self.user_id) {
                Ok(rows) => format_task_lines(&rows),
                Err(err) => {
                    release_after_error(conn, &err);
                    return Err(err);
                }
            }
        };

        let body = format!(
            "Good morning! Here is your daily summary.\n\n\
             Inbox:\n{inbox}\n\nTasks:\n{task_lines}\n"
        );

        let mut session = self.mail_pool.acquire().await?;
        match session
            .send(&self.self_address, "Your daily summary", &body)
            .await
        {
            Ok(message_id) => {
                tracing::info!(message_id, "daily summary sent");
                Ok(())
            }
            Err(err) => {
                release_after_error(session, &err);
                Err(err)
            }
        }
    }
}

/// 把每日摘要挪到别的时刻
pub struct RescheduleSummaryHandler {
    scheduler: Arc<DailyScheduler>,
}

impl RescheduleSummaryHandler {
    pub fn new(scheduler: Arc<DailyScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Handler for RescheduleSummaryHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::RescheduleSummary
    }

    async fn execute(&self, _user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::RescheduleSummary { at } = intent else {
            return Err(mismatched(self.kind()));
        };
        let at = at.ok_or_else(|| {
            AssistantError::validation("time", "not a recognizable time of day")
        })?;
        if self.scheduler.reschedule(DAILY_SUMMARY_JOB, at) {
            Ok(format!(
                "Daily summary rescheduled to {}.",
                at.format("%H:%M")
            ))
        } else {
            Err(AssistantError::Internal(
                "daily summary job is not registered".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;
    use crate::core::PoolConfig;
    use crate::providers::{
        MockMailConnector, MockMailbox, MockStoreConnector, MockStoreLog, QueryOutput,
        SqliteTaskStore,
    };

    fn job_with(mailbox: &Arc<MockMailbox>, log: &Arc<MockStoreLog>) -> DailySummaryJob {
        DailySummaryJob::new(
            ResourcePool::new(
                "mail",
                Arc::new(MockMailConnector::new(mailbox.clone())),
                PoolConfig::default(),
            ),
            ResourcePool::new(
                "store",
                Arc::new(MockStoreConnector::new(log.clone())),
                PoolConfig::default(),
            ),
            Arc::new(SqliteTaskStore),
            "u1".to_string(),
            "me@example.com".to_string(),
            5,
        )
    }

    #[tokio::test]
    async fn test_summary_mails_inbox_and_tasks_to_self() {
        let mailbox = MockMailbox::seeded();
        let log = MockStoreLog::new();
        log.push_output(QueryOutput {
            columns: vec![
                "description".into(),
                "due_date".into(),
                "priority".into(),
                "status".into(),
            ],
            rows: vec![vec![
                "Buy milk".into(),
                "2024-03-02".into(),
                "medium".into(),
                "pending".into(),
            ]],
            affected: 0,
        });

        job_with(&mailbox, &log).run().await.unwrap();

        let sent = mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "me@example.com");
        assert_eq!(sent[0].subject, "Your daily summary");
        assert!(sent[0].body.contains("Lunch on Friday?"));
        assert!(sent[0].body.contains("Buy milk"));
    }

    #[tokio::test]
    async fn test_summary_send_failure_surfaces_as_error() {
        let mailbox = MockMailbox::seeded();
        let log = MockStoreLog::new();
        mailbox.fail_next_sends(1);

        let err = job_with(&mailbox, &log).run().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(mailbox.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_handler_moves_the_job() {
        let scheduler = DailyScheduler::new();
        struct Noop;
        #[async_trait]
        impl JobHandler for Noop {
            fn name(&self) -> &str {
                DAILY_SUMMARY_JOB
            }
            async fn run(&self) -> Result<(), AssistantError> {
                Ok(())
            }
        }
        scheduler.register(NaiveTime::from_hms_opt(6, 0, 0).unwrap(), Arc::new(Noop));
        let handler = RescheduleSummaryHandler::new(scheduler);

        let reply = handler
            .execute(
                "u1",
                &Intent::RescheduleSummary {
                    at: Some(NaiveTime::from_hms_opt(7, 30, 0).unwrap()),
                },
            )
            .await
            .unwrap();

        assert_eq!(reply, "Daily summary rescheduled to 07:30.");
    }

    #[tokio::test]
    async fn test_reschedule_without_a_time_names_the_field() {
        let handler = RescheduleSummaryHandler::new(DailyScheduler::new());

        let err = handler
            .execute("u1", &Intent::RescheduleSummary { at: None })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AssistantError::Validation { field: "time", .. }
        ));
        assert_eq!(
            err.user_message(),
            "Invalid time: not a recognizable time of day"
        );
    }

    #[tokio::test]
    async fn test_reschedule_without_registered_job_is_an_error() {
        let handler = RescheduleSummaryHandler::new(DailyScheduler::new());

        let err = handler
            .execute(
                "u1",
                &Intent::RescheduleSummary {
                    at: Some(NaiveTime::from_hms_opt(7, 0, 0).unwrap()),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AssistantError::Internal(_)));
    }
}
