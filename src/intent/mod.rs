//! 意图路由：规则快匹配 + 模型兜底的两段式分类
//!
//! 第一段是确定性关键词规则，零成本也不占模型预算；第二段在限流额度内
//! 调用模型，但只让它选标签，参数仍由规则解析。任何一步失败都收敛为
//! Unclassified，路由本身从不向上抛错。

pub mod parse;

use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::{AssistantError, RateLimiter, RetryPolicy};
use crate::providers::TextModel;

use self::parse::{
    extract_clock_time, extract_email, extract_subject_body, find_date_phrase,
    nearest_future_datetime, parse_natural_date, parse_time_of_day, split_due_phrase,
    strip_search_prefixes, strip_task_prefixes,
};

/// 任务截止日；`assumed` 表示日期是补出来的而非用户说的
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueDate {
    pub date: NaiveDate,
    pub assumed: bool,
}

/// 识别出的用户意图，参数已解析完毕
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SendMail {
        to: Option<String>,
        subject: String,
        body: String,
    },
    CheckMail,
    AddTask {
        description: String,
        due: DueDate,
    },
    ListTasks,
    TaskInsights,
    RunQuery {
        sql: String,
    },
    WebSearch {
        query: String,
    },
    ScheduleMeeting {
        attendee: String,
        start: NaiveDateTime,
        date_assumed: bool,
    },
    RescheduleSummary {
        /// 解析不出钟点时为 None，由处理器报校验错误
        at: Option<NaiveTime>,
    },
    KnowledgeLookup {
        question: String,
    },
    Unclassified,
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::SendMail { .. } => IntentKind::SendMail,
            Intent::CheckMail => IntentKind::CheckMail,
            Intent::AddTask { .. } => IntentKind::AddTask,
            Intent::ListTasks => IntentKind::ListTasks,
            Intent::TaskInsights => IntentKind::TaskInsights,
            Intent::RunQuery { .. } => IntentKind::RunQuery,
            Intent::WebSearch { .. } => IntentKind::WebSearch,
            Intent::ScheduleMeeting { .. } => IntentKind::ScheduleMeeting,
            Intent::RescheduleSummary { .. } => IntentKind::RescheduleSummary,
            Intent::KnowledgeLookup { .. } => IntentKind::KnowledgeLookup,
            Intent::Unclassified => IntentKind::Unclassified,
        }
    }
}

/// 不带参数的意图标签；模型分类与处理器注册表都以它为键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    SendMail,
    CheckMail,
    AddTask,
    ListTasks,
    TaskInsights,
    RunQuery,
    WebSearch,
    ScheduleMeeting,
    RescheduleSummary,
    KnowledgeLookup,
    Unclassified,
}

impl IntentKind {
    pub const ALL: [IntentKind; 11] = [
        IntentKind::SendMail,
        IntentKind::CheckMail,
        IntentKind::AddTask,
        IntentKind::ListTasks,
        IntentKind::TaskInsights,
        IntentKind::RunQuery,
        IntentKind::WebSearch,
        IntentKind::ScheduleMeeting,
        IntentKind::RescheduleSummary,
        IntentKind::KnowledgeLookup,
        IntentKind::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::SendMail => "send_mail",
            IntentKind::CheckMail => "check_mail",
            IntentKind::AddTask => "add_task",
            IntentKind::ListTasks => "list_tasks",
            IntentKind::TaskInsights => "task_insights",
            IntentKind::RunQuery => "run_query",
            IntentKind::WebSearch => "web_search",
            IntentKind::ScheduleMeeting => "schedule_meeting",
            IntentKind::RescheduleSummary => "reschedule_summary",
            IntentKind::KnowledgeLookup => "knowledge_lookup",
            IntentKind::Unclassified => "unclassified",
        }
    }
}

/// 模型分类的返回载荷；schema 由 schemars 生成并随提示词下发
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RouterVerdict {
    pub intent: IntentKind,
}

/// 分类结论的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// 关键词规则直接命中
    Rule,
    /// 模型选了标签
    Model,
    /// 分类失败后的兜底
    Fallback,
}

/// 一次分类的完整结果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: Confidence,
}

impl Classification {
    fn fallback() -> Self {
        Self {
            intent: Intent::Unclassified,
            confidence: Confidence::Fallback,
        }
    }
}

/// 两段式意图路由器
pub struct IntentRouter {
    model: Arc<dyn TextModel>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn TextModel>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            model,
            limiter,
            retry,
        }
    }

    /// 对一条用户请求分类
    pub async fn classify(&self, request: &str) -> Classification {
        self.classify_at(request, Local::now().naive_local()).await
    }

    // 时钟由参数传入，测试用
    async fn classify_at(&self, request: &str, now: NaiveDateTime) -> Classification {
        if let Some(intent) = fast_match(request, now) {
            tracing::debug!(intent = intent.kind().as_str(), "intent matched by rule");
            return Classification {
                intent,
                confidence: Confidence::Rule,
            };
        }

        if !self.limiter.try_acquire("llm").await {
            tracing::warn!("llm budget exhausted, skipping model classification");
            return Classification::fallback();
        }

        match self.llm_classify(request, now).await {
            Ok(classification) => classification,
            Err(err) => {
                tracing::warn!(error = %err, "model classification failed, falling back");
                Classification::fallback()
            }
        }
    }

    /// 让模型在封闭标签集里选一个；传输层错误走重试，其余一律兜底
    async fn llm_classify(
        &self,
        request: &str,
        now: NaiveDateTime,
    ) -> Result<Classification, AssistantError> {
        let prompt = classification_prompt(request);
        let schema = verdict_schema();
        let raw = self
            .retry
            .run("classify intent", || {
                self.model.complete_json(&prompt, &schema)
            })
            .await?;

        let verdict: RouterVerdict = match serde_json::from_str(raw.trim()) {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(error = %err, "model verdict did not parse, treating as unclassified");
                return Ok(Classification::fallback());
            }
        };

        if matches!(verdict.intent, IntentKind::Unclassified) {
            return Ok(Classification {
                intent: Intent::Unclassified,
                confidence: Confidence::Model,
            });
        }

        match build_intent(verdict.intent, request, now) {
            Some(intent) => Ok(Classification {
                intent,
                confidence: Confidence::Model,
            }),
            None => {
                tracing::debug!(
                    kind = verdict.intent.as_str(),
                    "verdict accepted but arguments missing, treating as unclassified"
                );
                Ok(Classification::fallback())
            }
        }
    }
}

fn classification_prompt(request: &str) -> String {
    format!(
        r#"Classify the user's request into exactly one intent tag.

Tags:
- send_mail: compose and send an email
- check_mail: summarize recent inbox messages
- add_task: create a new to-do item
- list_tasks: show pending to-do items
- task_insights: statistics about stored tasks
- run_query: run a SQL statement against the local store
- web_search: look information up on the web
- schedule_meeting: put a meeting on the calendar
- reschedule_summary: move the daily summary mail to another time
- knowledge_lookup: a question about the assistant itself or its notes
- unclassified: none of the above fit

User request: {request}"#
    )
}

fn verdict_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(RouterVerdict))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 关键词规则；命中但参数解析不出来时返回 None，交给模型段
fn fast_match(request: &str, now: NaiveDateTime) -> Option<Intent> {
    let lower = request.trim().to_lowercase();
    let first_word = lower.split_whitespace().next().unwrap_or("");

    if matches!(first_word, "select" | "insert" | "update" | "delete") {
        return build_intent(IntentKind::RunQuery, request, now);
    }
    if lower.starts_with("check mail")
        || lower.starts_with("check email")
        || lower.starts_with("check my mail")
        || lower.starts_with("check my email")
        || lower.contains("any new mail")
        || lower == "inbox"
    {
        return Some(Intent::CheckMail);
    }
    if lower.starts_with("add task")
        || lower.starts_with("add a task")
        || lower.starts_with("remind me")
        || lower.starts_with("reminder")
    {
        return build_intent(IntentKind::AddTask, request, now);
    }
    if lower.starts_with("list tasks")
        || lower.starts_with("show tasks")
        || lower.starts_with("show my tasks")
        || lower.starts_with("my tasks")
        || lower.starts_with("pending tasks")
    {
        return Some(Intent::ListTasks);
    }
    if lower.contains("task insights") || lower.contains("task stats") {
        return Some(Intent::TaskInsights);
    }
    if lower.starts_with("reschedule") && (lower.contains("summary") || lower.contains("digest")) {
        return build_intent(IntentKind::RescheduleSummary, request, now);
    }
    if (lower.starts_with("schedule") || lower.contains("meeting"))
        && extract_email(request).is_some()
    {
        return build_intent(IntentKind::ScheduleMeeting, request, now);
    }
    if lower.starts_with("send")
        && (lower.contains("mail") || lower.contains("email") || extract_email(request).is_some())
    {
        return build_intent(IntentKind::SendMail, request, now);
    }
    if lower.starts_with("search")
        || lower.starts_with("google")
        || lower.starts_with("look up")
        || lower.starts_with("web search")
    {
        return build_intent(IntentKind::WebSearch, request, now);
    }
    if lower.starts_with("who are you")
        || lower.starts_with("what can you do")
        || lower.contains("about yourself")
    {
        return build_intent(IntentKind::KnowledgeLookup, request, now);
    }

    None
}

/// 从请求文本里抽出该标签需要的参数；缺必填参数返回 None
fn build_intent(kind: IntentKind, request: &str, now: NaiveDateTime) -> Option<Intent> {
    let today = now.date();
    match kind {
        IntentKind::SendMail => {
            let (subject, body) = extract_subject_body(request);
            Some(Intent::SendMail {
                to: extract_email(request),
                subject: subject.unwrap_or_else(|| "Quick note".to_string()),
                body: body.unwrap_or_else(|| request.trim().to_string()),
            })
        }
        IntentKind::CheckMail => Some(Intent::CheckMail),
        IntentKind::AddTask => {
            let stripped = strip_task_prefixes(request);
            let (description, due_phrase) = split_due_phrase(&stripped);
            if description.is_empty() {
                return None;
            }
            let due = match due_phrase
                .as_deref()
                .and_then(|phrase| parse_natural_date(phrase, today))
            {
                Some(date) => DueDate {
                    date,
                    assumed: false,
                },
                None => DueDate {
                    date: today.succ_opt()?,
                    assumed: true,
                },
            };
            Some(Intent::AddTask { description, due })
        }
        IntentKind::ListTasks => Some(Intent::ListTasks),
        IntentKind::TaskInsights => Some(Intent::TaskInsights),
        IntentKind::RunQuery => {
            let sql = request.trim();
            if sql.is_empty() {
                return None;
            }
            Some(Intent::RunQuery {
                sql: sql.to_string(),
            })
        }
        IntentKind::WebSearch => {
            let query = strip_search_prefixes(request);
            if query.is_empty() {
                return None;
            }
            Some(Intent::WebSearch { query })
        }
        IntentKind::ScheduleMeeting => {
            let attendee = extract_email(request)?;
            let time = extract_clock_time(request)?;
            let date = find_date_phrase(request, today);
            let (start, date_assumed) = nearest_future_datetime(time, date, now);
            Some(Intent::ScheduleMeeting {
                attendee,
                start,
                date_assumed,
            })
        }
        IntentKind::RescheduleSummary => {
            // 改点意图一旦命中就是终局，时间解析失败也不回退给模型
            let at = extract_clock_time(request)
                .or_else(|| request.split_whitespace().find_map(parse_time_of_day));
            Some(Intent::RescheduleSummary { at })
        }
        IntentKind::KnowledgeLookup => Some(Intent::KnowledgeLookup {
            question: request.trim().to_string(),
        }),
        IntentKind::Unclassified => Some(Intent::Unclassified),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::core::{Budget, RateLimiter, RetryPolicy};
    use crate::providers::MockTextModel;

    fn clock() -> NaiveDateTime {
        // 2024-03-01 是周五
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn router_with(model: Arc<MockTextModel>) -> IntentRouter {
        IntentRouter::new(
            model,
            Arc::new(RateLimiter::new().with_budget("llm", Budget::new(10, 60))),
            RetryPolicy::new(3, 10, 2.0),
        )
    }

    #[tokio::test]
    async fn test_rule_matches_add_task_with_due() {
        let model = Arc::new(MockTextModel::new());
        let router = router_with(model.clone());

        let result = router
            .classify_at("Add task: Buy milk due tomorrow", clock())
            .await;

        assert_eq!(result.confidence, Confidence::Rule);
        match result.intent {
            Intent::AddTask { description, due } => {
                assert_eq!(description, "Buy milk");
                assert_eq!(due.date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
                assert!(!due.assumed);
            }
            other => panic!("expected AddTask, got {other:?}"),
        }
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rule_assumes_tomorrow_when_due_missing() {
        let router = router_with(Arc::new(MockTextModel::new()));
        let result = router.classify_at("remind me to stretch", clock()).await;

        match result.intent {
            Intent::AddTask { description, due } => {
                assert_eq!(description, "stretch");
                assert_eq!(due.date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
                assert!(due.assumed);
            }
            other => panic!("expected AddTask, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rule_matches_sql_prefix_verbatim() {
        let router = router_with(Arc::new(MockTextModel::new()));
        let sql = "SELECT description FROM tasks WHERE status = 'pending'";
        let result = router.classify_at(sql, clock()).await;

        assert_eq!(result.confidence, Confidence::Rule);
        assert_eq!(
            result.intent,
            Intent::RunQuery {
                sql: sql.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rule_matches_meeting_with_explicit_day() {
        let router = router_with(Arc::new(MockTextModel::new()));
        let result = router
            .classify_at(
                "Schedule a meeting with bob@example.com at 3 pm on monday",
                clock(),
            )
            .await;

        match result.intent {
            Intent::ScheduleMeeting {
                attendee,
                start,
                date_assumed,
            } => {
                assert_eq!(attendee, "bob@example.com");
                assert_eq!(
                    start,
                    NaiveDate::from_ymd_opt(2024, 3, 4)
                        .unwrap()
                        .and_hms_opt(15, 0, 0)
                        .unwrap()
                );
                assert!(!date_assumed);
            }
            other => panic!("expected ScheduleMeeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_meeting_without_day_lands_on_nearest_future() {
        let router = router_with(Arc::new(MockTextModel::new()));
        // 现在是 10:00，9 am 已过，应落到明天
        let result = router
            .classify_at("schedule a call with bob@example.com at 9 am", clock())
            .await;

        match result.intent {
            Intent::ScheduleMeeting {
                start, date_assumed, ..
            } => {
                assert_eq!(
                    start,
                    NaiveDate::from_ymd_opt(2024, 3, 2)
                        .unwrap()
                        .and_hms_opt(9, 0, 0)
                        .unwrap()
                );
                assert!(date_assumed);
            }
            other => panic!("expected ScheduleMeeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rule_extracts_mail_subject_and_body() {
        let router = router_with(Arc::new(MockTextModel::new()));
        let result = router
            .classify_at(
                "Send an email to bob@example.com subject: Lunch body: See you at noon",
                clock(),
            )
            .await;

        assert_eq!(
            result.intent,
            Intent::SendMail {
                to: Some("bob@example.com".to_string()),
                subject: "Lunch".to_string(),
                body: "See you at noon".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_rule_matches_reschedule_summary() {
        let router = router_with(Arc::new(MockTextModel::new()));
        let result = router
            .classify_at("Reschedule the summary to 7:30 am", clock())
            .await;

        assert_eq!(
            result.intent,
            Intent::RescheduleSummary {
                at: Some(chrono::NaiveTime::from_hms_opt(7, 30, 0).unwrap())
            }
        );
    }

    #[tokio::test]
    async fn test_reschedule_with_garbled_time_still_routes() {
        let model = Arc::new(MockTextModel::new());
        let router = router_with(model.clone());
        let result = router
            .classify_at("reschedule the summary to whenever", clock())
            .await;

        // 规则命中即终局，不再找模型兜底
        assert_eq!(result.confidence, Confidence::Rule);
        assert_eq!(result.intent, Intent::RescheduleSummary { at: None });
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_stage_used_when_rules_miss() {
        let model = Arc::new(MockTextModel::new().with_reply(r#"{"intent":"web_search"}"#));
        let router = router_with(model.clone());

        let result = router
            .classify_at("anything good written about the borrow checker?", clock())
            .await;

        assert_eq!(result.confidence, Confidence::Model);
        match result.intent {
            Intent::WebSearch { query } => assert!(query.contains("borrow checker")),
            other => panic!("expected WebSearch, got {other:?}"),
        }
        assert_eq!(model.call_count(), 1);
        // 提示词里必须带封闭标签集
        assert!(model.prompts()[0].contains("schedule_meeting"));
    }

    #[tokio::test]
    async fn test_rate_denied_skips_model_entirely() {
        let model = Arc::new(MockTextModel::new());
        let router = IntentRouter::new(
            model.clone(),
            Arc::new(RateLimiter::new().with_budget("llm", Budget::new(0, 60))),
            RetryPolicy::new(3, 10, 2.0),
        );

        let result = router.classify_at("completely opaque request", clock()).await;

        assert_eq!(result.confidence, Confidence::Fallback);
        assert_eq!(result.intent, Intent::Unclassified);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_transient_failure_retries_then_falls_back() {
        let model = Arc::new(
            MockTextModel::new()
                .with_failure(AssistantError::TransientIo("reset".into()))
                .with_failure(AssistantError::TransientIo("reset".into()))
                .with_failure(AssistantError::TransientIo("reset".into())),
        );
        let router = router_with(model.clone());

        let result = router.classify_at("completely opaque request", clock()).await;

        assert_eq!(result.confidence, Confidence::Fallback);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_verdict_falls_back() {
        for reply in ["beep boop", r#"{"intent":"make_coffee"}"#] {
            let router = router_with(Arc::new(MockTextModel::new().with_reply(reply)));
            let result = router.classify_at("completely opaque request", clock()).await;
            assert_eq!(result.intent, Intent::Unclassified);
            assert_eq!(result.confidence, Confidence::Fallback);
        }
    }

    #[tokio::test]
    async fn test_model_saying_unclassified_is_a_model_verdict() {
        // 默认 mock 的 complete_json 就回 unclassified
        let router = router_with(Arc::new(MockTextModel::new()));
        let result = router.classify_at("completely opaque request", clock()).await;

        assert_eq!(result.intent, Intent::Unclassified);
        assert_eq!(result.confidence, Confidence::Model);
    }
}
