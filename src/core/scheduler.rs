//! 定时调度：每日固定时刻触发的后台任务
//!
//! 每分钟走一次钟（tick），到点且当天未触发过的任务各执行一次。
//! 注册时若目标时刻当天已过，直接记为"今天已触发"，避免重启后补跑。
//! 任务失败只记日志，调度循环继续。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;

use crate::core::AssistantError;

/// 定时任务处理器；name 作为改期与日志的标识
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<(), AssistantError>;
}

struct JobSlot {
    fire_at: NaiveTime,
    last_fired: Option<NaiveDate>,
    handler: Arc<dyn JobHandler>,
}

/// 每日调度器；每个任务在钟走过 fire_at 之后的首个 tick 触发，一天至多一次
pub struct DailyScheduler {
    jobs: Mutex<Vec<JobSlot>>,
    cancel: CancellationToken,
}

impl DailyScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// 注册每日任务
    pub fn register(&self, fire_at: NaiveTime, handler: Arc<dyn JobHandler>) {
        self.register_clocked(fire_at, handler, Local::now().naive_local());
    }

    fn register_clocked(
        &self,
        fire_at: NaiveTime,
        handler: Arc<dyn JobHandler>,
        now: NaiveDateTime,
    ) {
        // 时刻已过则记为今天已触发，下一次触发在明天
        let last_fired = if now.time() >= fire_at {
            Some(now.date())
        } else {
            None
        };
        tracing::info!(job = handler.name(), %fire_at, "registered daily job");
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.push(JobSlot {
            fire_at,
            last_fired,
            handler,
        });
    }

    /// 改期任务；新时刻今天还没到则今天重新生效，已过则明天生效。
    /// 返回是否找到该任务。
    pub fn reschedule(&self, job_name: &str, fire_at: NaiveTime) -> bool {
        self.reschedule_clocked(job_name, fire_at, Local::now().naive_local())
    }

    fn reschedule_clocked(&self, job_name: &str, fire_at: NaiveTime, now: NaiveDateTime) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        match jobs.iter_mut().find(|j| j.handler.name() == job_name) {
            Some(job) => {
                job.fire_at = fire_at;
                job.last_fired = if now.time() >= fire_at {
                    Some(now.date())
                } else {
                    None
                };
                tracing::info!(job = job_name, %fire_at, "rescheduled daily job");
                true
            }
            None => {
                tracing::warn!(job = job_name, "reschedule target not found");
                false
            }
        }
    }

    /// 单次走钟：触发所有到点且当天未触发的任务。
    /// 触发前先记账，同一天不会重复触发，即使任务失败。
    pub async fn tick_once(&self, now: NaiveDateTime) {
        let due: Vec<Arc<dyn JobHandler>> = {
            let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
            jobs.iter_mut()
                .filter(|j| now.time() >= j.fire_at && j.last_fired != Some(now.date()))
                .map(|j| {
                    j.last_fired = Some(now.date());
                    j.handler.clone()
                })
                .collect()
        };

        for handler in due {
            tracing::info!(job = handler.name(), "daily job firing");
            if let Err(err) = handler.run().await {
                tracing::error!(job = handler.name(), error = %err, "daily job failed");
            }
        }
    }

    /// 启动后台循环，每分钟 tick 一次；shutdown 后退出
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => {
                        tracing::debug!("scheduler loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        scheduler.tick_once(Local::now().naive_local()).await;
                    }
                }
            }
        })
    }

    /// 停止后台循环；已在执行中的任务跑完当次
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
