//! SQLite 存储实现
//!
//! 连接由资源池管理（一个句柄一条连接，同一 DB 文件）；建连时执行幂等
//! 建表。所有 SQL 走位置参数，任何用户文本都不拼进语句。

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::core::pool::HandleFactory;
use crate::core::AssistantError;
use crate::providers::traits::{
    CalendarStore, HistoryStore, NewEvent, NewTask, QueryOutput, StoreConn, TaskRow, TaskStats,
    TaskStore,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    description TEXT NOT NULL,
    due_date    TEXT NOT NULL,
    priority    TEXT NOT NULL DEFAULT 'medium',
    status      TEXT NOT NULL DEFAULT 'pending',
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    title      TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time   TEXT NOT NULL,
    attendee   TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    request    TEXT NOT NULL,
    reply      TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

fn map_sqlite_err(err: rusqlite::Error) -> AssistantError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            AssistantError::TransientIo(format!("sqlite: {err}"))
        }
        _ => AssistantError::Internal(format!("sqlite: {err}")),
    }
}

fn value_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// 单条 SQLite 连接；StoreConn 的真实现
pub struct SqliteConn {
    conn: Connection,
}

impl StoreConn for SqliteConn {
    fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput, AssistantError> {
        let is_select = sql.trim_start().to_ascii_lowercase().starts_with("select");
        let bound = rusqlite::params_from_iter(params.iter());

        if is_select {
            let mut stmt = self.conn.prepare(sql).map_err(map_sqlite_err)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let column_count = columns.len();
            let mut rows = stmt.query(bound).map_err(map_sqlite_err)?;
            let mut output = QueryOutput {
                columns,
                ..Default::default()
            };
            while let Some(row) = rows.next().map_err(map_sqlite_err)? {
                let mut record = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    record.push(value_to_string(row.get_ref(i).map_err(map_sqlite_err)?));
                }
                output.rows.push(record);
            }
            Ok(output)
        } else {
            let affected = self.conn.execute(sql, bound).map_err(map_sqlite_err)?;
            Ok(QueryOutput {
                affected,
                ..Default::default()
            })
        }
    }
}

/// 连接工厂：打开 DB 文件并幂等建表
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HandleFactory<Box<dyn StoreConn>> for SqliteConnector {
    async fn create(&self) -> Result<Box<dyn StoreConn>, AssistantError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AssistantError::Internal(format!("store dir: {e}")))?;
            }
        }
        let conn = Connection::open(&self.path).map_err(map_sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_err)?;
        tracing::debug!(path = %self.path.display(), "sqlite connection opened");
        Ok(Box::new(SqliteConn { conn }))
    }
}

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// tasks 表的存取
pub struct SqliteTaskStore;

impl TaskStore for SqliteTaskStore {
    fn add(&self, conn: &mut dyn StoreConn, task: &NewTask) -> Result<(), AssistantError> {
        conn.query(
            "INSERT INTO tasks (user_id, description, due_date, priority) VALUES (?1, ?2, ?3, ?4)",
            &[
                task.user_id.clone(),
                task.description.clone(),
                task.due.format(DATE_FMT).to_string(),
                task.priority.clone(),
            ],
        )?;
        Ok(())
    }

    fn pending(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
    ) -> Result<Vec<TaskRow>, AssistantError> {
        let output = conn.query(
            "SELECT description, due_date, priority, status FROM tasks \
             WHERE user_id = ?1 AND status = 'pending' ORDER BY due_date",
            &[user_id.to_string()],
        )?;
        output
            .rows
            .into_iter()
            .map(|row| {
                let due = NaiveDate::parse_from_str(&row[1], DATE_FMT)
                    .map_err(|e| AssistantError::Internal(format!("bad due_date in store: {e}")))?;
                Ok(TaskRow {
                    description: row[0].clone(),
                    due,
                    priority: row[2].clone(),
                    status: row[3].clone(),
                })
            })
            .collect()
    }

    fn update_status(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        description: &str,
        status: &str,
    ) -> Result<usize, AssistantError> {
        let output = conn.query(
            "UPDATE tasks SET status = ?1 WHERE user_id = ?2 AND description = ?3",
            &[status.to_string(), user_id.to_string(), description.to_string()],
        )?;
        Ok(output.affected)
    }

    fn stats(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
    ) -> Result<TaskStats, AssistantError> {
        let counts = conn.query(
            "SELECT status, COUNT(*) FROM tasks WHERE user_id = ?1 GROUP BY status ORDER BY status",
            &[user_id.to_string()],
        )?;
        let by_status = counts
            .rows
            .iter()
            .map(|row| (row[0].clone(), row[1].parse::<u32>().unwrap_or(0)))
            .collect();

        let avg = conn.query(
            "SELECT AVG(julianday(due_date) - julianday(date('now'))) FROM tasks \
             WHERE user_id = ?1 AND status = 'pending'",
            &[user_id.to_string()],
        )?;
        let avg_days_until_due = avg
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.parse::<f64>().ok());

        Ok(TaskStats {
            by_status,
            avg_days_until_due,
        })
    }
}

/// events 表的存取
pub struct SqliteCalendarStore;

impl CalendarStore for SqliteCalendarStore {
    fn add_event(&self, conn: &mut dyn StoreConn, event: &NewEvent) -> Result<(), AssistantError> {
        conn.query(
            "INSERT INTO events (user_id, title, start_time, end_time, attendee) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                event.user_id.clone(),
                event.title.clone(),
                event.start.format(DATETIME_FMT).to_string(),
                event.end.format(DATETIME_FMT).to_string(),
                event.attendee.clone(),
            ],
        )?;
        Ok(())
    }

    fn events_on(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<String>, AssistantError> {
        let output = conn.query(
            "SELECT title FROM events WHERE user_id = ?1 AND date(start_time) = ?2 \
             ORDER BY start_time",
            &[user_id.to_string(), date.format(DATE_FMT).to_string()],
        )?;
        Ok(output.rows.into_iter().map(|mut r| r.remove(0)).collect())
    }
}

/// history 表的存取
pub struct SqliteHistoryStore;

impl HistoryStore for SqliteHistoryStore {
    fn record(
        &self,
        conn: &mut dyn StoreConn,
        user_id: &str,
        request: &str,
        reply: &str,
    ) -> Result<(), AssistantError> {
        conn.query(
            "INSERT INTO history (user_id, request, reply) VALUES (?1, ?2, ?3)",
            &[user_id.to_string(), request.to_string(), reply.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Days, NaiveDateTime, Utc};

    use super::*;

    async fn open_conn(dir: &tempfile::TempDir) -> Box<dyn StoreConn> {
        SqliteConnector::new(dir.path().join("test.db"))
            .create()
            .await
            .unwrap()
    }

    // date('now') 按 UTC 取日，保持一致
    fn in_days(n: u64) -> NaiveDate {
        Utc::now().date_naive().checked_add_days(Days::new(n)).unwrap()
    }

    #[tokio::test]
    async fn test_task_roundtrip_and_status_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;
        let store = SqliteTaskStore;

        store
            .add(
                conn.as_mut(),
                &NewTask {
                    user_id: "u1".into(),
                    description: "Buy milk".into(),
                    due: in_days(1),
                    priority: "medium".into(),
                },
            )
            .unwrap();

        let pending = store.pending(conn.as_mut(), "u1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description, "Buy milk");
        assert_eq!(pending[0].due, in_days(1));
        assert_eq!(pending[0].status, "pending");

        let affected = store
            .update_status(conn.as_mut(), "u1", "Buy milk", "done")
            .unwrap();
        assert_eq!(affected, 1);
        assert!(store.pending(conn.as_mut(), "u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_are_scoped_by_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;
        let store = SqliteTaskStore;

        store
            .add(
                conn.as_mut(),
                &NewTask {
                    user_id: "u1".into(),
                    description: "mine".into(),
                    due: in_days(1),
                    priority: "high".into(),
                },
            )
            .unwrap();

        assert!(store.pending(conn.as_mut(), "u2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status_and_average_days() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;
        let store = SqliteTaskStore;

        for (desc, days) in [("a", 2), ("b", 4)] {
            store
                .add(
                    conn.as_mut(),
                    &NewTask {
                        user_id: "u1".into(),
                        description: desc.into(),
                        due: in_days(days),
                        priority: "medium".into(),
                    },
                )
                .unwrap();
        }
        store
            .add(
                conn.as_mut(),
                &NewTask {
                    user_id: "u1".into(),
                    description: "c".into(),
                    due: in_days(1),
                    priority: "low".into(),
                },
            )
            .unwrap();
        store.update_status(conn.as_mut(), "u1", "c", "done").unwrap();

        let stats = store.stats(conn.as_mut(), "u1").unwrap();
        assert_eq!(
            stats.by_status,
            vec![("done".to_string(), 1), ("pending".to_string(), 2)]
        );
        let avg = stats.avg_days_until_due.unwrap();
        assert!((avg - 3.0).abs() < 0.01, "avg was {avg}");
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;
        let store = SqliteCalendarStore;

        let start =
            NaiveDateTime::parse_from_str("2024-03-05 14:00:00", DATETIME_FMT).unwrap();
        store
            .add_event(
                conn.as_mut(),
                &NewEvent {
                    user_id: "u1".into(),
                    title: "Meeting with bob@example.com".into(),
                    start,
                    end: start + chrono::Duration::hours(1),
                    attendee: "bob@example.com".into(),
                },
            )
            .unwrap();

        let on_day = store
            .events_on(conn.as_mut(), "u1", start.date())
            .unwrap();
        assert_eq!(on_day, vec!["Meeting with bob@example.com".to_string()]);
        assert!(store
            .events_on(conn.as_mut(), "u1", in_days(30))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_history_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;

        SqliteHistoryStore
            .record(conn.as_mut(), "u1", "what is rust", "a language")
            .unwrap();

        let output = conn
            .query("SELECT request, reply FROM history", &[])
            .unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0], vec!["what is rust", "a language"]);
    }

    #[tokio::test]
    async fn test_select_exposes_columns_and_dml_exposes_affected() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open_conn(&dir).await;

        let dml = conn
            .query(
                "INSERT INTO tasks (user_id, description, due_date) VALUES (?1, ?2, ?3)",
                &["u1".into(), "t".into(), "2024-03-05".into()],
            )
            .unwrap();
        assert_eq!(dml.affected, 1);

        let select = conn
            .query("SELECT description FROM tasks WHERE user_id = ?1", &["u1".into()])
            .unwrap();
        assert_eq!(select.columns, vec!["description".to_string()]);
        assert_eq!(select.rows, vec![vec!["t".to_string()]]);
    }
}
