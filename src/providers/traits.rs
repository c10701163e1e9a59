//! 外部协作者抽象
//!
//! 邮件传输、关系存储、联网检索、知识索引与文本模型都经由窄接口注入，
//! mock 实现与真实现可互换。核心层只依赖这里的 trait，不触碰具体协议。

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::core::AssistantError;

/// 最近邮件列表的条目（头部摘要）
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub subject: String,
    pub from: String,
    pub date: String,
}

/// 联网检索结果条目
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// 关系查询输出：SELECT 填 columns + rows，DML 填 affected
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub affected: usize,
}

/// 知识库片段
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub source: String,
    pub text: String,
}

/// 新任务；priority 缺省 medium
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: String,
    pub description: String,
    pub due: NaiveDate,
    pub priority: String,
}

/// 待办行
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub description: String,
    pub due: NaiveDate,
    pub priority: String,
    pub status: String,
}

/// 任务统计：按状态计数 + 平均剩余天数
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub by_status: Vec<(String, u32)>,
    pub avg_days_until_due: Option<f64>,
}

/// 新日程
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub user_id: String,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub attendee: String,
}

/// 文本模型：自由生成与受 schema 约束的结构化生成
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AssistantError>;

    /// 返回符合 schema 的 JSON 文本；调用方负责反序列化与校验
    async fn complete_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, AssistantError>;

    /// 离线 mock 返回 true，编排器据此跳过回复格式化
    fn is_mock(&self) -> bool {
        false
    }
}

/// 邮件会话：从资源池借出的长生命周期句柄
#[async_trait]
pub trait MailSession: Send + Sync {
    /// 最近 limit 封邮件的头部摘要，新的在前
    async fn list_recent(
        &mut self,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<MailMessage>, AssistantError>;

    /// 发送邮件，返回消息 ID
    async fn send(&mut self, to: &str, subject: &str, body: &str)
        -> Result<String, AssistantError>;
}

/// 关系存储连接。一律位置参数绑定，核心不把用户文本拼进 SQL。
pub trait StoreConn: Send {
    fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput, AssistantError>;
}

/// 任务存取；conn 由调用方从池里借出传入
pub trait TaskStore: Send + Sync {
    fn add(&self, conn: &mut dyn StoreConn, task: &NewTask) -> Result<(), AssistantError>;

    fn pending(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
    ) -> Result<Vec<TaskRow>, AssistantError>;

    /// 返回受影响的行数
    fn update_status(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        description: &str,
        status: &str,
    ) -> Result<usize, AssistantError>;

    fn stats(&self, conn: &mut dyn StoreConn, user_id: &str)
        -> Result<TaskStats, AssistantError>;
}

/// 日程存取
pub trait CalendarStore: Send + Sync {
    fn add_event(&self, conn: &mut dyn StoreConn, event: &NewEvent) -> Result<(), AssistantError>;

    /// 某天的日程标题列表，按开始时间排序
    fn events_on(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<String>, AssistantError>;
}

/// 问答历史记录
pub trait HistoryStore: Send + Sync {
    fn record(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        request: &str,
        reply: &str,
    ) -> Result<(), AssistantError>;
}

/// 联网检索；按天窗口限流，能力键独立
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AssistantError>;
}

/// 本地知识索引
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    async fn similarity_search(
        &self,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, AssistantError>;
}

/// 文本向量化（知识索引内部使用）
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}
