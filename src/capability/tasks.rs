//! 任务能力：记录待办、列表与统计

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, release_after_error, Handler};
use crate::core::{AssistantError, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{NewTask, StoreConn, TaskRow, TaskStore};

/// 新建待办；优先级暂不从文本解析，统一 medium
pub struct AddTaskHandler {
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    tasks: Arc<dyn TaskStore>,
}

impl AddTaskHandler {
    pub fn new(pool: Arc<ResourcePool<Box<dyn StoreConn>>>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { pool, tasks }
    }
}

#[async_trait]
impl Handler for AddTaskHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::AddTask
    }

    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::AddTask { description, due } = intent else {
            return Err(mismatched(self.kind()));
        };
        let task = NewTask {
            user_id: user_id.to_string(),
            description: description.clone(),
            due: due.date,
            priority: "medium".to_string(),
        };

        let mut conn = self.pool.acquire().await?;
        if let Err(err) = self.tasks.add(&mut **conn, &task) {
            release_after_error(conn, &err);
            return Err(err);
        }

        let mut reply = format!(
            "Added task \"{}\" due {}.",
            description,
            due.date.format("%Y-%m-%d")
        );
        if due.assumed {
            reply.push_str(" I assumed tomorrow since no due date was given.");
        }
        Ok(reply)
    }
}

/// 待办列表
pub struct ListTasksHandler {
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    tasks: Arc<dyn TaskStore>,
}

impl ListTasksHandler {
    pub fn new(pool: Arc<ResourcePool<Box<dyn StoreConn>>>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { pool, tasks }
    }
}

#[async_trait]
impl Handler for ListTasksHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::ListTasks
    }

    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        if !matches!(intent, Intent::ListTasks) {
            return Err(mismatched(self.kind()));
        }
        let mut conn = self.pool.acquire().await?;
        match self.tasks.pending(&mut **conn, user_id) {
            Ok(rows) => Ok(format_task_lines(&rows)),
            Err(err) => {
                release_after_error(conn, &err);
                Err(err)
            }
        }
    }
}

pub(crate) fn format_task_lines(rows: &[TaskRow]) -> String {
    if rows.is_empty() {
        return "No pending tasks.".to_string();
    }
    let mut lines = vec![format!("You have {} pending task(s):", rows.len())];
    for row in rows {
        lines.push(format!(
            "{} (Due: {}, Priority: {})",
            row.description,
            row.due.format("%Y-%m-%d"),
            row.priority
        ));
    }
    lines.join("\n")
}

/// 任务统计：按状态计数 + 平均剩余天数
pub struct TaskInsightsHandler {
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    tasks: Arc<dyn TaskStore>,
}

impl TaskInsightsHandler {
    pub fn new(pool: Arc<ResourcePool<Box<dyn StoreConn>>>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { pool, tasks }
    }
}

#[async_trait]
impl Handler for TaskInsightsHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::TaskInsights
    }

    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        if !matches!(intent, Intent::TaskInsights) {
            return Err(mismatched(self.kind()));
        }
        let mut conn = self.pool.acquire().await?;
        let stats = match self.tasks.stats(&mut **conn, user_id) {
            Ok(stats) => stats,
            Err(err) => {
                release_after_error(conn, &err);
                return Err(err);
            }
        };

        if stats.by_status.is_empty() {
            return Ok("You have no tasks on record yet.".to_string());
        }
        let counts: Vec<String> = stats
            .by_status
            .iter()
            .map(|(status, n)| format!("{n} {status}"))
            .collect();
        let mut reply = format!("Task insights: {}.", counts.join(", "));
        match stats.avg_days_until_due {
            Some(avg) => reply.push_str(&format!(
                " Pending work is due in {avg:.1} day(s) on average."
            )),
            None => reply.push_str(" Nothing pending has a due date to average."),
        }
        Ok(reply)
    }
}
