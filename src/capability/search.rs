//! 联网检索能力

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, Handler};
use crate::core::AssistantError;
use crate::intent::{Intent, IntentKind};
use crate::providers::SearchProvider;

pub struct WebSearchHandler {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearchHandler {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results,
        }
    }
}

#[async_trait]
impl Handler for WebSearchHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::WebSearch
    }

    fn capability(&self) -> Option<&'static str> {
        Some("search")
    }

    async fn execute(&self, _user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::WebSearch { query } = intent else {
            return Err(mismatched(self.kind()));
        };
        let hits = self.provider.search(query, self.max_results).await?;
        if hits.is_empty() {
            return Ok(format!("No results found for \"{query}\"."));
        }

        let mut lines = vec![format!("Top results for \"{query}\":")];
        for (i, hit) in hits.iter().enumerate() {
            lines.push(format!("{}. {} - {}", i + 1, hit.title, hit.url));
            if !hit.snippet.is_empty() {
                lines.push(format!("   {}", hit.snippet));
            }
        }
        Ok(lines.join("\n"))
    }
}
