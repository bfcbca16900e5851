//! 补全记录的 SQLite 存储（同步）

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::types::{PendingRecord, RecordListResponse, RecordQuery, StoredRecord};
use crate::capture::types::CompletionRecord;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS completion_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id TEXT NOT NULL UNIQUE,
        context_id TEXT NOT NULL,
        captured_at_ms INTEGER NOT NULL,
        model TEXT NOT NULL,
        chain_id TEXT,
        turn_number INTEGER,
        record_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_records_context ON completion_records(context_id);
    CREATE INDEX IF NOT EXISTS idx_records_captured ON completion_records(captured_at_ms);
    CREATE INDEX IF NOT EXISTS idx_records_model ON completion_records(model);";

/// 底层 SQLite 存储
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开记录数据库失败: {}", db_path))?;
        Self::init(conn)
    }

    /// 内存数据库，进程退出即丢失
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("初始化记录表失败")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 批量写入，trace_id 重复的记录被忽略；返回实际写入条数
    pub fn insert_batch(&self, records: &[PendingRecord]) -> Result<usize> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO completion_records
                    (trace_id, context_id, captured_at_ms, model, chain_id, turn_number, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for pending in records {
                let record = &pending.record;
                let json = serde_json::to_string(record)?;
                inserted += stmt.execute(rusqlite::params![
                    record.trace_id,
                    pending.context_id,
                    record.captured_at_ms,
                    record.model_name(),
                    record.chain_id,
                    record.turn_number,
                    json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn query(&self, filter: &RecordQuery) -> Result<RecordListResponse> {
        let conn = self.lock();
        let page = filter.page.unwrap_or(1).max(1);
        let page_size = filter.page_size.unwrap_or(50).clamp(1, 200);
        let offset = (page - 1) as i64 * page_size as i64;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref context_id) = filter.context_id {
            where_clauses.push(format!("context_id = ?{}", params.len() + 1));
            params.push(Box::new(context_id.clone()));
        }
        if let Some(ref model) = filter.model {
            where_clauses.push(format!("model = ?{}", params.len() + 1));
            params.push(Box::new(model.clone()));
        }
        if let Some(since) = filter.since_ms {
            where_clauses.push(format!("captured_at_ms >= ?{}", params.len() + 1));
            params.push(Box::new(since));
        }
        if let Some(until) = filter.until_ms {
            where_clauses.push(format!("captured_at_ms <= ?{}", params.len() + 1));
            params.push(Box::new(until));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM completion_records {}", where_sql);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let query_sql = format!(
            "SELECT id, context_id, record_json FROM completion_records {}
             ORDER BY captured_at_ms DESC, id DESC LIMIT ?{} OFFSET ?{}",
            where_sql,
            params.len() + 1,
            params.len() + 2
        );
        params.push(Box::new(page_size as i64));
        params.push(Box::new(offset));

        let mut stmt = conn.prepare(&query_sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let records = rows
            .into_iter()
            .filter_map(|(id, context_id, json)| {
                Some(StoredRecord {
                    id,
                    context_id,
                    record: decode(id, &json)?,
                })
            })
            .collect();

        Ok(RecordListResponse {
            total,
            page,
            page_size,
            records,
        })
    }

    /// 读取全部记录（按捕获时间升序），无法解析的行跳过
    pub fn load_all(&self) -> Result<Vec<CompletionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, record_json FROM completion_records ORDER BY captured_at_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, json)| decode(id, &json))
            .collect())
    }

    /// 清除记录；`before_ms` 为空时清空全部
    pub fn clear(&self, before_ms: Option<i64>) -> Result<u64> {
        let conn = self.lock();
        let count = match before_ms {
            Some(before) => conn.execute(
                "DELETE FROM completion_records WHERE captured_at_ms < ?1",
                [before],
            )?,
            None => conn.execute("DELETE FROM completion_records", [])?,
        };
        Ok(count as u64)
    }
}

fn decode(id: i64, json: &str) -> Option<CompletionRecord> {
    match serde_json::from_str(json) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(row_id = id, "跳过无法解析的记录: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::RequestInfo;

    fn pending(context_id: &str, trace_id: &str, model: &str, at: i64) -> PendingRecord {
        PendingRecord {
            context_id: context_id.to_string(),
            record: CompletionRecord {
                trace_id: trace_id.to_string(),
                captured_at_ms: at,
                request: Some(RequestInfo {
                    model: Some(model.to_string()),
                    ..Default::default()
                }),
                chain_id: Some("chain".to_string()),
                turn_number: Some(1),
                ..Default::default()
            },
        }
    }

    fn seeded() -> RecordStore {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .insert_batch(&[
                pending("tab-1", "t1", "qwen", 1000),
                pending("tab-1", "t2", "qwen", 2000),
                pending("tab-2", "t3", "llama", 3000),
            ])
            .unwrap();
        store
    }

    /// 相同 trace_id 只写入一次
    #[test]
    fn test_insert_ignores_duplicate_trace() {
        let store = seeded();
        let inserted = store
            .insert_batch(&[pending("tab-9", "t1", "qwen", 9000)])
            .unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.load_all().unwrap().len(), 3);
    }

    #[test]
    fn test_query_filters_and_pages() {
        let store = seeded();

        let all = store.query(&RecordQuery::default()).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.records[0].record.trace_id, "t3");

        let by_context = store
            .query(&RecordQuery {
                context_id: Some("tab-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_context.total, 2);

        let by_model = store
            .query(&RecordQuery {
                model: Some("llama".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_model.total, 1);
        assert_eq!(by_model.records[0].context_id, "tab-2");

        let window = store
            .query(&RecordQuery {
                since_ms: Some(1500),
                until_ms: Some(2500),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.total, 1);
        assert_eq!(window.records[0].record.trace_id, "t2");

        let second_page = store
            .query(&RecordQuery {
                page: Some(2),
                page_size: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second_page.total, 3);
        assert_eq!(second_page.records.len(), 1);
        assert_eq!(second_page.records[0].record.trace_id, "t1");
    }

    /// 损坏的 JSON 行被跳过而不是让整个读取失败
    #[test]
    fn test_load_all_skips_corrupt_rows() {
        let store = seeded();
        store
            .lock()
            .execute(
                "INSERT INTO completion_records
                    (trace_id, context_id, captured_at_ms, model, record_json)
                 VALUES ('bad', 'tab-1', 1500, 'qwen', '{not json')",
                [],
            )
            .unwrap();
        let records = store.load_all().unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_clear_before() {
        let store = seeded();
        assert_eq!(store.clear(Some(2000)).unwrap(), 1);
        assert_eq!(store.load_all().unwrap().len(), 2);
        assert_eq!(store.clear(None).unwrap(), 2);
        assert!(store.load_all().unwrap().is_empty());
    }
}
