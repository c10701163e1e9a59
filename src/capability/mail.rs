//! 邮件能力：收件箱摘要与发信
//!
//! 摘要走 TTL 缓存，命中时完全不碰邮件会话池；发信不缓存。
//! 传输失败的会话一律作废，不让坏句柄污染池子。

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, release_after_error, Handler};
use crate::core::{AssistantError, ResourcePool, TtlCache};
use crate::intent::{Intent, IntentKind};
use crate::providers::{MailMessage, MailSession};

pub(crate) const INBOX_CACHE_KEY: &str = "inbox";

/// 收件箱摘要
pub struct CheckMailHandler {
    pool: Arc<ResourcePool<Box<dyn MailSession>>>,
    cache: Arc<TtlCache<String, String>>,
    recent_limit: usize,
}

impl CheckMailHandler {
    pub fn new(
        pool: Arc<ResourcePool<Box<dyn MailSession>>>,
        cache: Arc<TtlCache<String, String>>,
        recent_limit: usize,
    ) -> Self {
        Self {
            pool,
            cache,
            recent_limit,
        }
    }
}

#[async_trait]
impl Handler for CheckMailHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::CheckMail
    }

    async fn execute(&self, _user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        if !matches!(intent, Intent::CheckMail) {
            return Err(mismatched(self.kind()));
        }
        if let Some(cached) = self.cache.get(&INBOX_CACHE_KEY.to_string()).await {
            tracing::debug!("inbox summary served from cache");
            return Ok(cached);
        }
        let summary = fetch_inbox_summary(&self.pool, self.recent_limit).await?;
        self.cache
            .insert(INBOX_CACHE_KEY.to_string(), summary.clone())
            .await;
        Ok(summary)
    }
}

/// 绕过缓存拉一份新鲜的收件箱摘要；每日汇总也用它
pub(crate) async fn fetch_inbox_summary(
    pool: &Arc<ResourcePool<Box<dyn MailSession>>>,
    limit: usize,
) -> Result<String, AssistantError> {
    let mut session = pool.acquire().await?;
    match session.list_recent("INBOX", limit).await {
        Ok(mails) => Ok(format_mail_summary(&mails)),
        Err(err) => {
            release_after_error(session, &err);
            Err(err)
        }
    }
}

fn format_mail_summary(mails: &[MailMessage]) -> String {
    if mails.is_empty() {
        return "Your inbox has no recent messages.".to_string();
    }
    let mut lines = vec![format!("You have {} recent message(s):", mails.len())];
    for (i, mail) in mails.iter().enumerate() {
        lines.push(format!(
            "{}. {} (from {}, {})",
            i + 1,
            mail.subject,
            mail.from,
            mail.date
        ));
    }
    lines.join("\n")
}

/// 发信；收件人缺省发给自己
pub struct SendMailHandler {
    pool: Arc<ResourcePool<Box<dyn MailSession>>>,
    self_address: String,
}

impl SendMailHandler {
    pub fn new(pool: Arc<ResourcePool<Box<dyn MailSession>>>, self_address: String) -> Self {
        Self { pool, self_address }
    }
}

#[async_trait]
impl Handler for SendMailHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::SendMail
    }

    fn capability(&self) -> Option<&'static str> {
        Some("mail_send")
    }

    async fn execute(&self, _user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::SendMail { to, subject, body } = intent else {
            return Err(mismatched(self.kind()));
        };
        let to = to.clone().unwrap_or_else(|| self.self_address.clone());

        let mut session = self.pool.acquire().await?;
        match session.send(&to, subject, body).await {
            Ok(message_id) => {
                tracing::info!(%to, message_id, "mail sent");
                Ok(format!("Mail sent to {to}: \"{subject}\""))
            }
            Err(err) => {
                release_after_error(session, &err);
                Err(err)
            }
        }
    }
}
