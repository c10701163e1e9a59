//! 知识问答能力
//!
//! 先从本地索引捞相关片段，再让模型用片段作答。问答记录进 history 表，
//! 但记录失败不影响回复。

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, record_history, Handler};
use crate::core::{AssistantError, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{Document, HistoryStore, KnowledgeIndex, StoreConn, TextModel};

pub struct KnowledgeLookupHandler {
    index: Arc<dyn KnowledgeIndex>,
    model: Arc<dyn TextModel>,
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    history: Arc<dyn HistoryStore>,
    top_k: usize,
}

impl KnowledgeLookupHandler {
    pub fn new(
        index: Arc<dyn KnowledgeIndex>,
        model: Arc<dyn TextModel>,
        pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
        history: Arc<dyn HistoryStore>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            model,
            pool,
            history,
            top_k,
        }
    }
}

#[async_trait]
impl Handler for KnowledgeLookupHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::KnowledgeLookup
    }

    fn capability(&self) -> Option<&'static str> {
        Some("llm")
    }

    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::KnowledgeLookup { question } = intent else {
            return Err(mismatched(self.kind()));
        };

        let docs = self.index.similarity_search(question, self.top_k).await?;
        tracing::debug!(matches = docs.len(), "knowledge lookup retrieved notes");
        let reply = self.model.complete(&answer_prompt(&docs, question)).await?;

        record_history(&self.pool, &self.history, user_id, question, &reply).await;
        Ok(reply)
    }
}

fn answer_prompt(docs: &[Document], question: &str) -> String {
    let context = if docs.is_empty() {
        "(no notes matched)".to_string()
    } else {
        docs.iter()
            .map(|doc| format!("[{}] {}", doc.source, doc.text))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Answer the question briefly, using the notes when they help.\n\n\
         Notes:\n{context}\n\nQuestion: {question}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PoolConfig;
    use crate::providers::{MockKnowledgeIndex, MockStoreConnector, MockStoreLog, MockTextModel};

    fn handler_with(
        log: &Arc<MockStoreLog>,
        model: Arc<MockTextModel>,
    ) -> KnowledgeLookupHandler {
        KnowledgeLookupHandler::new(
            Arc::new(MockKnowledgeIndex::with_docs(vec![Document {
                source: "usage-notes".into(),
                text: "The assistant keeps tasks in a local store.".into(),
            }])),
            model,
            ResourcePool::new(
                "store",
                Arc::new(MockStoreConnector::new(log.clone())),
                PoolConfig::default(),
            ),
            Arc::new(crate::providers::SqliteHistoryStore),
            3,
        )
    }

    #[tokio::test]
    async fn test_notes_are_fed_to_the_model_and_history_recorded() {
        let log = MockStoreLog::new();
        let model = Arc::new(MockTextModel::new().with_reply("It stores them locally."));
        let handler = handler_with(&log, model.clone());

        let reply = handler
            .execute(
                "u1",
                &Intent::KnowledgeLookup {
                    question: "where do my tasks live?".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(reply, "It stores them locally.");
        assert!(model.prompts()[0].contains("usage-notes"));
        assert!(model.prompts()[0].contains("where do my tasks live?"));

        let recorded = log.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].sql.starts_with("INSERT INTO history"));
        assert!(recorded[0]
            .params
            .contains(&"where do my tasks live?".to_string()));
    }

    #[tokio::test]
    async fn test_history_failure_does_not_break_the_reply() {
        let log = MockStoreLog::new();
        log.fail_next_queries(1);
        let model = Arc::new(MockTextModel::new().with_reply("Still answered."));
        let handler = handler_with(&log, model);

        let reply = handler
            .execute(
                "u1",
                &Intent::KnowledgeLookup {
                    question: "anything?".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(reply, "Still answered.");
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let log = MockStoreLog::new();
        let model = Arc::new(
            MockTextModel::new().with_failure(AssistantError::TransientIo("timeout".into())),
        );
        let handler = handler_with(&log, model);

        let err = handler
            .execute(
                "u1",
                &Intent::KnowledgeLookup {
                    question: "anything?".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        // 没有回复就不该写历史
        assert_eq!(log.query_count(), 0);
    }
}
