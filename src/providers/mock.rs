//! Mock 协作者（离线运行与测试）
//!
//! 每个 mock 都记录收到的调用并支持按次注入失败，用于重试路径与
//! "从未触达存储"这类断言。没有配置真实后端时，编排器也用它们兜底。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::pool::HandleFactory;
use crate::core::AssistantError;
use crate::providers::traits::{
    Document, KnowledgeIndex, MailMessage, MailSession, QueryOutput, SearchHit, SearchProvider,
    StoreConn, TextModel,
};

/// 脚本化文本模型；脚本耗尽后 complete 回显提示词、complete_json 回退为
/// unclassified 判定
#[derive(Default)]
pub struct MockTextModel {
    script: Mutex<VecDeque<Result<String, AssistantError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockTextModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条脚本回复（按调用顺序弹出）
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.script
            .lock()
            .expect("mock model lock poisoned")
            .push_back(Ok(text.into()));
        self
    }

    /// 追加一次失败
    pub fn with_failure(self, err: AssistantError) -> Self {
        self.script
            .lock()
            .expect("mock model lock poisoned")
            .push_back(Err(err));
        self
    }

    /// 已收到的提示词
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock model lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().expect("mock model lock poisoned").len()
    }

    fn next_scripted(&self) -> Option<Result<String, AssistantError>> {
        self.script
            .lock()
            .expect("mock model lock poisoned")
            .pop_front()
    }
}

#[async_trait]
impl TextModel for MockTextModel {
    async fn complete(&self, prompt: &str) -> Result<String, AssistantError> {
        self.prompts
            .lock()
            .expect("mock model lock poisoned")
            .push(prompt.to_string());
        match self.next_scripted() {
            Some(result) => result,
            None => Ok(format!("[mock] {}", prompt.lines().last().unwrap_or(""))),
        }
    }

    async fn complete_json(
        &self,
        prompt: &str,
        _schema: &serde_json::Value,
    ) -> Result<String, AssistantError> {
        self.prompts
            .lock()
            .expect("mock model lock poisoned")
            .push(prompt.to_string());
        match self.next_scripted() {
            Some(result) => result,
            None => Ok(r#"{"intent":"unclassified"}"#.to_string()),
        }
    }

    fn is_mock(&self) -> bool {
        true
    }
}

/// 已发送邮件的记录
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// 内存邮箱：会话间共享收件箱与发件记录
#[derive(Default)]
pub struct MockMailbox {
    inbox: Mutex<Vec<MailMessage>>,
    sent: Mutex<Vec<SentMail>>,
    fail_sends: AtomicU32,
    fail_connects: AtomicU32,
    sessions_created: AtomicU32,
}

impl MockMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 预置几封示例邮件（离线 REPL 的默认收件箱）
    pub fn seeded() -> Arc<Self> {
        let mailbox = Self::new();
        mailbox.push_incoming("Team sync notes", "alice@example.com", "2024-03-01 09:12");
        mailbox.push_incoming("Invoice #1042", "billing@example.com", "2024-03-01 14:30");
        mailbox.push_incoming("Lunch on Friday?", "bob@example.com", "2024-03-02 08:05");
        mailbox
    }

    pub fn push_incoming(&self, subject: &str, from: &str, date: &str) {
        self.inbox
            .lock()
            .expect("mailbox lock poisoned")
            .push(MailMessage {
                subject: subject.to_string(),
                from: from.to_string(),
                date: date.to_string(),
            });
    }

    /// 接下来 n 次 send 失败（瞬态错误）
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// 接下来 n 次建立会话失败
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().expect("mailbox lock poisoned").clone()
    }

    pub fn sessions_created(&self) -> u32 {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

/// 注入的失败次数递减；归零后不再失败
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct MockMailSession {
    mailbox: Arc<MockMailbox>,
}

#[async_trait]
impl MailSession for MockMailSession {
    async fn list_recent(
        &mut self,
        _folder: &str,
        limit: usize,
    ) -> Result<Vec<MailMessage>, AssistantError> {
        let inbox = self.mailbox.inbox.lock().expect("mailbox lock poisoned");
        Ok(inbox.iter().rev().take(limit).cloned().collect())
    }

    async fn send(
        &mut self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, AssistantError> {
        if take_failure(&self.mailbox.fail_sends) {
            return Err(AssistantError::TransientIo("smtp: connection reset".into()));
        }
        self.mailbox
            .sent
            .lock()
            .expect("mailbox lock poisoned")
            .push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// 邮件会话工厂；资源池经由它懒建会话
pub struct MockMailConnector {
    mailbox: Arc<MockMailbox>,
}

impl MockMailConnector {
    pub fn new(mailbox: Arc<MockMailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl HandleFactory<Box<dyn MailSession>> for MockMailConnector {
    async fn create(&self) -> Result<Box<dyn MailSession>, AssistantError> {
        if take_failure(&self.mailbox.fail_connects) {
            return Err(AssistantError::TransientIo("imap: connect timeout".into()));
        }
        self.mailbox.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMailSession {
            mailbox: self.mailbox.clone(),
        }))
    }
}

/// 一次被执行的查询
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// 存储调用账本：连接间共享，记录每条 SQL 以及脚本化的返回值
#[derive(Default)]
pub struct MockStoreLog {
    queries: Mutex<Vec<RecordedQuery>>,
    outputs: Mutex<VecDeque<QueryOutput>>,
    fail_next: AtomicU32,
}

impl MockStoreLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_output(&self, output: QueryOutput) {
        self.outputs
            .lock()
            .expect("store log lock poisoned")
            .push_back(output);
    }

    pub fn fail_next_queries(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<RecordedQuery> {
        self.queries.lock().expect("store log lock poisoned").clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().expect("store log lock poisoned").len()
    }
}

struct MockStoreConn {
    log: Arc<MockStoreLog>,
}

impl StoreConn for MockStoreConn {
    fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput, AssistantError> {
        self.log
            .queries
            .lock()
            .expect("store log lock poisoned")
            .push(RecordedQuery {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
        if take_failure(&self.log.fail_next) {
            return Err(AssistantError::TransientIo("sqlite: database is locked".into()));
        }
        Ok(self
            .log
            .outputs
            .lock()
            .expect("store log lock poisoned")
            .pop_front()
            .unwrap_or_default())
    }
}

/// 存储连接工厂
pub struct MockStoreConnector {
    log: Arc<MockStoreLog>,
}

impl MockStoreConnector {
    pub fn new(log: Arc<MockStoreLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl HandleFactory<Box<dyn StoreConn>> for MockStoreConnector {
    async fn create(&self) -> Result<Box<dyn StoreConn>, AssistantError> {
        Ok(Box::new(MockStoreConn {
            log: self.log.clone(),
        }))
    }
}

/// 脚本化检索
#[derive(Default)]
pub struct MockSearchProvider {
    hits: Vec<SearchHit>,
    queries: Mutex<Vec<String>>,
    fail_next: AtomicU32,
}

impl MockSearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 两条固定结果，够 REPL 离线演示
    pub fn canned() -> Self {
        Self::new().with_hits(vec![
            SearchHit {
                title: "Rust Programming Language".into(),
                url: "https://www.rust-lang.org".into(),
                snippet: "A language empowering everyone.".into(),
            },
            SearchHit {
                title: "Tokio - An asynchronous Rust runtime".into(),
                url: "https://tokio.rs".into(),
                snippet: "Reliable, fast, easy async I/O.".into(),
            },
        ])
    }

    pub fn with_hits(mut self, hits: Vec<SearchHit>) -> Self {
        self.hits = hits;
        self
    }

    pub fn fail_next_searches(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("mock search lock poisoned").clone()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AssistantError> {
        self.queries
            .lock()
            .expect("mock search lock poisoned")
            .push(query.to_string());
        if take_failure(&self.fail_next) {
            return Err(AssistantError::TransientIo("search: 503 upstream".into()));
        }
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

/// 固定文档集合的知识索引
#[derive(Default)]
pub struct MockKnowledgeIndex {
    docs: Vec<Document>,
}

impl MockKnowledgeIndex {
    pub fn with_docs(docs: Vec<Document>) -> Self {
        Self { docs }
    }
}

#[async_trait]
impl KnowledgeIndex for MockKnowledgeIndex {
    async fn similarity_search(
        &self,
        _text: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, AssistantError> {
        Ok(self.docs.iter().take(top_k).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_model_pops_in_order_then_falls_back() {
        let model = MockTextModel::new()
            .with_reply("first")
            .with_failure(AssistantError::TransientIo("timeout".into()));

        assert_eq!(model.complete("p1").await.unwrap(), "first");
        assert!(model.complete("p2").await.is_err());
        // 脚本耗尽后 complete_json 回退为 unclassified
        let fallback = model
            .complete_json("p3", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(fallback.contains("unclassified"));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mailbox_lists_newest_first_and_records_sends() {
        let mailbox = MockMailbox::seeded();
        let connector = MockMailConnector::new(mailbox.clone());
        let mut session = connector.create().await.unwrap();

        let recent = session.list_recent("INBOX", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].subject, "Lunch on Friday?");

        session.send("bob@example.com", "Re: Lunch", "Sure.").await.unwrap();
        assert_eq!(mailbox.sent().len(), 1);
        assert_eq!(mailbox.sent()[0].to, "bob@example.com");
    }

    #[tokio::test]
    async fn test_mailbox_send_failure_injection_is_consumed() {
        let mailbox = MockMailbox::new();
        let connector = MockMailConnector::new(mailbox.clone());
        let mut session = connector.create().await.unwrap();
        mailbox.fail_next_sends(1);

        assert!(session.send("a@b.c", "s", "b").await.is_err());
        assert!(session.send("a@b.c", "s", "b").await.is_ok());
    }

    #[tokio::test]
    async fn test_store_log_records_sql_and_params() {
        let log = MockStoreLog::new();
        let connector = MockStoreConnector::new(log.clone());
        let mut conn = connector.create().await.unwrap();

        conn.query("SELECT * FROM tasks WHERE user_id = ?1", &["u1".into()])
            .unwrap();
        let recorded = log.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].params, vec!["u1".to_string()]);
    }
}
