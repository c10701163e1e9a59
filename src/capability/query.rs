//! 原始 SQL 能力：先过守卫再进存储
//!
//! 守卫是保守的词法检查：首关键字白名单、全文禁用词黑名单、单语句限制。
//! 字符串字面量里出现禁用词也会被拒，宁可误杀不可放过。被拒的语句
//! 不会产生任何存储调用。

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, release_after_error, Handler};
use crate::core::{AssistantError, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{QueryOutput, StoreConn};

const DENIED_KEYWORDS: [&str; 11] = [
    "DROP", "TRUNCATE", "ALTER", "CREATE", "REPLACE", "GRANT", "REVOKE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM",
];

const MAX_ROWS_SHOWN: usize = 20;

/// 校验用户 SQL；不通过返回 Validation 错误
pub fn validate_sql(sql: &str) -> Result<(), AssistantError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(AssistantError::validation("sql", "statement is empty"));
    }

    let upper = trimmed.to_uppercase();
    let first = upper.split_whitespace().next().unwrap_or("");
    if !matches!(first, "SELECT" | "INSERT" | "UPDATE" | "DELETE") {
        return Err(AssistantError::validation(
            "sql",
            "only select, insert, update and delete statements are allowed",
        ));
    }

    for token in upper.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if DENIED_KEYWORDS.contains(&token) {
            return Err(AssistantError::validation(
                "sql",
                format!("{} statements are not allowed", token.to_lowercase()),
            ));
        }
    }

    if let Some(pos) = trimmed.find(';') {
        if !trimmed[pos + 1..].trim().is_empty() {
            return Err(AssistantError::validation(
                "sql",
                "multiple statements are not allowed",
            ));
        }
    }

    Ok(())
}

/// 执行一条（已通过守卫的）语句并排版结果
pub struct RunQueryHandler {
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
}

impl RunQueryHandler {
    pub fn new(pool: Arc<ResourcePool<Box<dyn StoreConn>>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Handler for RunQueryHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::RunQuery
    }

    async fn execute(&self, _user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::RunQuery { sql } = intent else {
            return Err(mismatched(self.kind()));
        };
        validate_sql(sql)?;

        let mut conn = self.pool.acquire().await?;
        match conn.query(sql, &[]) {
            Ok(output) => Ok(format_query_output(&output)),
            Err(err) => {
                release_after_error(conn, &err);
                Err(err)
            }
        }
    }
}

fn format_query_output(output: &QueryOutput) -> String {
    if output.columns.is_empty() {
        return format!("Query OK, {} row(s) affected.", output.affected);
    }
    if output.rows.is_empty() {
        return "The query returned no rows.".to_string();
    }
    let mut lines = vec![output.columns.join(" | ")];
    for row in output.rows.iter().take(MAX_ROWS_SHOWN) {
        lines.push(row.join(" | "));
    }
    if output.rows.len() > MAX_ROWS_SHOWN {
        lines.push(format!(
            "... and {} more row(s)",
            output.rows.len() - MAX_ROWS_SHOWN
        ));
    }
    lines.join("\n")
}
