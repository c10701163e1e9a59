//! 编排器：校验、分类、限流、重试与超时的总装配点。
//!
//! 一次 `handle` 调用的路径是固定的：
//! 校验请求 -> 意图分类 -> 能力限流闸门 -> 带重试的处理器执行 -> 可选的回复润色。
//! 任何一步失败都折叠成一句面向用户的话，细节只进日志。

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::capability::{
    record_history, AddTaskHandler, CheckMailHandler, DailySummaryJob, Handler, HandlerRegistry,
    KnowledgeLookupHandler, ListTasksHandler, RescheduleSummaryHandler, RunQueryHandler,
    ScheduleMeetingHandler, SendMailHandler, TaskInsightsHandler, UnclassifiedHandler,
    WebSearchHandler,
};
use crate::config::AppConfig;
use crate::core::cache::{ArtifactCache, TtlCache};
use crate::core::error::AssistantError;
use crate::core::pool::{HandleFactory, ResourcePool};
use crate::core::rate_limit::RateLimiter;
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::DailyScheduler;
use crate::intent::parse::parse_time_of_day;
use crate::intent::{Confidence, IntentKind, IntentRouter};
use crate::providers::{
    CalendarStore, HashEmbedder, HistoryStore, HttpSearchProvider, KnowledgeIndex,
    LocalKnowledgeIndex, MailSession, MockMailConnector, MockMailbox, MockSearchProvider,
    MockTextModel, OpenAiTextModel, SearchProvider, SqliteCalendarStore, SqliteConnector,
    SqliteHistoryStore, SqliteTaskStore, StoreConn, TaskStore, TextModel,
};

/// 单条请求的长度上限，超过直接拒绝，不进分类。
const MAX_REQUEST_CHARS: usize = 5000;
/// user_id 长度上限。
const MAX_USER_ID_CHARS: usize = 100;

/// 装配编排器。所有外部依赖都可以注入替身，不注入则按配置落到真实实现。
pub struct OrchestratorBuilder {
    config: AppConfig,
    model: Option<Arc<dyn TextModel>>,
    store_factory: Option<Arc<dyn HandleFactory<Box<dyn StoreConn>>>>,
    mail_factory: Option<Arc<dyn HandleFactory<Box<dyn MailSession>>>>,
    search: Option<Arc<dyn SearchProvider>>,
    index: Option<Arc<dyn KnowledgeIndex>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            model: None,
            store_factory: None,
            mail_factory: None,
            search: None,
            index: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn TextModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_store_factory(
        mut self,
        factory: Arc<dyn HandleFactory<Box<dyn StoreConn>>>,
    ) -> Self {
        self.store_factory = Some(factory);
        self
    }

    pub fn with_mail_factory(
        mut self,
        factory: Arc<dyn HandleFactory<Box<dyn MailSession>>>,
    ) -> Self {
        self.mail_factory = Some(factory);
        self
    }

    pub fn with_search_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(provider);
        self
    }

    pub fn with_knowledge_index(mut self, index: Arc<dyn KnowledgeIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// 装配并启动。存储池预热失败视为致命错误；
    /// 邮件池预热失败只降级告警，句柄随用随建。
    pub async fn build(self) -> Result<Orchestrator, AssistantError> {
        let config = self.config;

        let model: Arc<dyn TextModel> = match self.model {
            Some(model) => model,
            None if config.llm.provider == "mock" => {
                tracing::info!("text model: mock backend (configured)");
                Arc::new(MockTextModel::new())
            }
            None => match OpenAiTextModel::from_config(&config.llm) {
                Some(client) => {
                    tracing::info!(model = %config.llm.model, "text model: openai backend");
                    Arc::new(client)
                }
                None => {
                    tracing::warn!("OPENAI_API_KEY is not set, falling back to the mock text model");
                    Arc::new(MockTextModel::new())
                }
            },
        };

        let limiter = Arc::new(
            RateLimiter::new()
                .with_budget("llm", config.limits.llm.as_budget())
                .with_budget("mail_send", config.limits.mail_send.as_budget())
                .with_budget("search", config.limits.search.as_budget()),
        );
        let retry = config.retry.as_policy();

        let store_factory: Arc<dyn HandleFactory<Box<dyn StoreConn>>> = match self.store_factory {
            Some(factory) => factory,
            None => Arc::new(SqliteConnector::new(config.store.path.clone())),
        };
        let store_pool = ResourcePool::new("store", store_factory, config.store.pool_config());
        // 没有存储就没有助手，预热失败直接拒绝启动。
        store_pool.warm_up().await?;

        let mail_factory: Arc<dyn HandleFactory<Box<dyn MailSession>>> = match self.mail_factory {
            Some(factory) => factory,
            None => Arc::new(MockMailConnector::new(MockMailbox::seeded())),
        };
        let mail_pool = ResourcePool::new("mail", mail_factory, config.mail.pool_config());
        if let Err(err) = mail_pool.warm_up().await {
            tracing::warn!(error = %err, "mail pool warm-up failed, sessions will be created on demand");
        }

        let search: Arc<dyn SearchProvider> = match self.search {
            Some(provider) => provider,
            None => match &config.search.endpoint {
                Some(endpoint) => Arc::new(HttpSearchProvider::new(
                    endpoint,
                    Duration::from_secs(config.search.timeout_secs),
                )?),
                None => {
                    tracing::info!("search endpoint not configured, serving canned results");
                    Arc::new(MockSearchProvider::canned())
                }
            },
        };

        let index: Arc<dyn KnowledgeIndex> = match self.index {
            Some(index) => index,
            None => {
                let cache = ArtifactCache::new(&config.knowledge.cache_dir);
                Arc::new(LocalKnowledgeIndex::open(
                    &config.knowledge.corpus_dir,
                    &cache,
                    Arc::new(HashEmbedder::default()),
                    config.knowledge.chunk_chars,
                    config.knowledge.overlap_chars,
                )?)
            }
        };

        let tasks: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore);
        let calendar: Arc<dyn CalendarStore> = Arc::new(SqliteCalendarStore);
        let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore);
        let mail_cache = Arc::new(TtlCache::new(Duration::from_secs(config.mail.cache_ttl_secs)));

        let fire_at = parse_time_of_day(&config.schedule.daily_summary).ok_or_else(|| {
            AssistantError::validation("schedule.daily_summary", "not a recognizable time of day")
        })?;
        let scheduler = DailyScheduler::new();
        scheduler.register(
            fire_at,
            Arc::new(DailySummaryJob::new(
                mail_pool.clone(),
                store_pool.clone(),
                tasks.clone(),
                config.app.user_id.clone(),
                config.mail.self_address.clone(),
                config.mail.recent_limit,
            )),
        );

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CheckMailHandler::new(
            mail_pool.clone(),
            mail_cache.clone(),
            config.mail.recent_limit,
        )));
        registry.register(Arc::new(SendMailHandler::new(
            mail_pool.clone(),
            config.mail.self_address.clone(),
        )));
        registry.register(Arc::new(AddTaskHandler::new(
            store_pool.clone(),
            tasks.clone(),
        )));
        registry.register(Arc::new(ListTasksHandler::new(
            store_pool.clone(),
            tasks.clone(),
        )));
        registry.register(Arc::new(TaskInsightsHandler::new(
            store_pool.clone(),
            tasks.clone(),
        )));
        registry.register(Arc::new(RunQueryHandler::new(store_pool.clone())));
        registry.register(Arc::new(WebSearchHandler::new(
            search,
            config.search.max_results,
        )));
        registry.register(Arc::new(ScheduleMeetingHandler::new(
            store_pool.clone(),
            calendar,
        )));
        registry.register(Arc::new(RescheduleSummaryHandler::new(scheduler.clone())));
        registry.register(Arc::new(KnowledgeLookupHandler::new(
            index,
            model.clone(),
            store_pool.clone(),
            history.clone(),
            config.knowledge.top_k,
        )));
        registry.register(Arc::new(UnclassifiedHandler));
        registry.ensure_complete()?;

        let router = IntentRouter::new(model.clone(), limiter.clone(), retry.clone());
        let scheduler_handle = scheduler.spawn();

        tracing::info!(user_id = %config.app.user_id, "orchestrator ready");
        Ok(Orchestrator {
            config,
            router,
            registry,
            limiter,
            retry,
            store_pool,
            mail_pool,
            mail_cache,
            scheduler,
            scheduler_handle: StdMutex::new(Some(scheduler_handle)),
            model,
            history,
        })
    }
}

/// 助手的门面。持有全部长生命周期资源，`handle` 处理一条请求并返回一句回复。
pub struct Orchestrator {
    config: AppConfig,
    router: IntentRouter,
    registry: HandlerRegistry,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    store_pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    mail_pool: Arc<ResourcePool<Box<dyn MailSession>>>,
    mail_cache: Arc<TtlCache<String, String>>,
    scheduler: Arc<DailyScheduler>,
    scheduler_handle: StdMutex<Option<JoinHandle<()>>>,
    model: Arc<dyn TextModel>,
    history: Arc<dyn HistoryStore>,
}

impl Orchestrator {
    /// 配置里的默认用户。
    pub fn user_id(&self) -> &str {
        &self.config.app.user_id
    }

    /// 处理一条请求。永远返回一句可以直接展示的话，错误也不例外。
    pub async fn handle(&self, user_id: &str, request: &str) -> String {
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = std::time::Instant::now();
        let budget = Duration::from_secs(self.config.app.request_timeout_secs);
        let reply = match tokio::time::timeout(budget, self.handle_inner(user_id, request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                tracing::warn!(request_id, error = %err, "request failed");
                err.user_message()
            }
            Err(_) => {
                let err = AssistantError::TransientIo(format!(
                    "request timed out after {}s",
                    budget.as_secs()
                ));
                tracing::warn!(request_id, timeout_secs = budget.as_secs(), "request timed out");
                err.user_message()
            }
        };
        tracing::info!(
            request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request served"
        );
        reply
    }

    async fn handle_inner(
        &self,
        user_id: &str,
        request: &str,
    ) -> Result<String, AssistantError> {
        validate_request(user_id, request)?;

        let classification = self.router.classify(request).await;
        let kind = classification.intent.kind();
        tracing::debug!(intent = kind.as_str(), confidence = ?classification.confidence, "intent classified");
        if matches!(classification.confidence, Confidence::Fallback) {
            tracing::debug!("serving the fallback path for an unrecognized request");
        }

        let handler = self.registry.get(kind).ok_or_else(|| {
            AssistantError::Internal(format!("no handler registered for: {}", kind.as_str()))
        })?;

        if let Some(capability) = handler.capability() {
            if !self.limiter.try_acquire(capability).await {
                let retry_after_secs = self
                    .limiter
                    .retry_after(capability)
                    .await
                    .map(|d| d.as_secs().max(1))
                    .unwrap_or(60);
                return Err(AssistantError::RateLimited {
                    capability: capability.to_string(),
                    retry_after_secs,
                });
            }
        }

        let reply = self
            .retry
            .run(kind.as_str(), || {
                handler.execute(user_id, &classification.intent)
            })
            .await?;
        let reply = self.maybe_structure(reply).await;

        // 兜底回复也进对话历史，方便事后翻看当时问了什么
        if kind == IntentKind::Unclassified {
            record_history(&self.store_pool, &self.history, user_id, request, &reply).await;
        }

        Ok(reply)
    }

    /// 可选的回复润色。关掉开关、mock 模型或 llm 预算耗尽时原样返回，润色失败也原样返回。
    async fn maybe_structure(&self, reply: String) -> String {
        if !self.config.app.structure_replies || self.model.is_mock() {
            return reply;
        }
        if !self.limiter.try_acquire("llm").await {
            tracing::debug!("llm budget exhausted, skipping reply structuring");
            return reply;
        }
        let prompt = format!(
            "Rewrite the reply below so it is tidy and friendly. \
             Keep every fact, keep it short, do not invent anything.\n\nReply:\n{reply}"
        );
        match self
            .retry
            .run("structure reply", || self.model.complete(&prompt))
            .await
        {
            Ok(structured) if !structured.trim().is_empty() => structured.trim().to_string(),
            Ok(_) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "reply structuring failed, returning the raw reply");
                reply
            }
        }
    }

    /// 停机：先停调度循环，再关两个池，最后清缓存。幂等。
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let handle = self.scheduler_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.mail_pool.shutdown().await;
        self.store_pool.shutdown().await;
        self.mail_cache.clear().await;
        tracing::info!("orchestrator stopped");
    }
}

/// 请求级校验，不合格的输入不消耗任何下游预算。
fn validate_request(user_id: &str, request: &str) -> Result<(), AssistantError> {
    if request.trim().is_empty() {
        return Err(AssistantError::validation("request", "must not be empty"));
    }
    if request.chars().count() > MAX_REQUEST_CHARS {
        return Err(AssistantError::validation(
            "request",
            format!("longer than {MAX_REQUEST_CHARS} characters"),
        ));
    }
    if user_id.is_empty() {
        return Err(AssistantError::validation("user_id", "must not be empty"));
    }
    if user_id.chars().count() > MAX_USER_ID_CHARS {
        return Err(AssistantError::validation(
            "user_id",
            format!("longer than {MAX_USER_ID_CHARS} characters"),
        ));
    }
    Ok(())
}
