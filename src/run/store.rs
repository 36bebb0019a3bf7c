//! Run 持久化存储
//!
//! 统一的存储接口，支持内存和 SQLite（async-sqlite feature）两种实现。
//! 按 run_id 为主键 upsert；list 按 started_at 倒序返回最近 limit 条。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::HiveError;
use crate::run::model::Run;

/// list 默认返回条数
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Run 存储接口：单行级原子 upsert
#[async_trait]
pub trait RunStore: Send + Sync {
    /// 按 run_id 插入或覆盖
    async fn upsert(&self, run: &Run) -> Result<(), HiveError>;

    /// 按 run_id 读取
    async fn get(&self, run_id: &str) -> Result<Option<Run>, HiveError>;

    /// 按 started_at 倒序返回最近 limit 条
    async fn list(&self, limit: Option<usize>) -> Result<Vec<Run>, HiveError>;

    /// 删除，返回是否存在
    async fn delete(&self, run_id: &str) -> Result<bool, HiveError>;
}

/// 内存 Run 存储
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn upsert(&self, run: &Run) -> Result<(), HiveError> {
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<Run>, HiveError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<Run>, HiveError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let mut all: Vec<Run> = self.runs.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn delete(&self, run_id: &str) -> Result<bool, HiveError> {
        Ok(self.runs.write().await.remove(run_id).is_some())
    }
}

/// SQLite Run 存储（sqlx 连接池）
#[cfg(feature = "async-sqlite")]
pub struct SqliteRunStore {
    pool: sqlx::sqlite::SqlitePool,
}

#[cfg(feature = "async-sqlite")]
impl SqliteRunStore {
    pub async fn new(db_path: impl AsRef<std::path::Path>) -> Result<Self, HiveError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await
            .map_err(|e| HiveError::Store(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                goal TEXT NOT NULL,
                state TEXT NOT NULL,
                steps TEXT NOT NULL,
                final_answer TEXT,
                error TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| HiveError::Store(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at DESC)")
            .execute(&pool)
            .await
            .map_err(|e| HiveError::Store(e.to_string()))?;

        Ok(Self { pool })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run, HiveError> {
        use sqlx::Row;

        let state: String = row.get("state");
        let steps_json: String = row.get("steps");
        Ok(Run {
            run_id: row.get("run_id"),
            goal: row.get("goal"),
            state: serde_json::from_value(serde_json::Value::String(state))
                .map_err(|e| HiveError::Store(e.to_string()))?,
            steps: serde_json::from_str(&steps_json)
                .map_err(|e| HiveError::Store(e.to_string()))?,
            final_answer: row.get("final_answer"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }
}

#[cfg(feature = "async-sqlite")]
#[async_trait]
impl RunStore for SqliteRunStore {
    async fn upsert(&self, run: &Run) -> Result<(), HiveError> {
        let state = serde_json::to_value(run.state)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "thinking".to_string());
        let steps =
            serde_json::to_string(&run.steps).map_err(|e| HiveError::Store(e.to_string()))?;

        sqlx::query(
            "INSERT INTO runs (run_id, goal, state, steps, final_answer, error, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id) DO UPDATE SET
                state = excluded.state,
                steps = excluded.steps,
                final_answer = excluded.final_answer,
                error = excluded.error,
                finished_at = excluded.finished_at",
        )
        .bind(&run.run_id)
        .bind(&run.goal)
        .bind(&state)
        .bind(&steps)
        .bind(&run.final_answer)
        .bind(&run.error)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| HiveError::Store(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<Run>, HiveError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HiveError::Store(e.to_string()))?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<Run>, HiveError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64;
        let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HiveError::Store(e.to_string()))?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn delete(&self, run_id: &str) -> Result<bool, HiveError> {
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HiveError::Store(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

/// 创建 Run 存储
///
/// 提供 db_path 且启用 async-sqlite feature 时使用 SQLite，否则回落到内存存储
pub async fn create_run_store(db_path: Option<&std::path::Path>) -> Arc<dyn RunStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteRunStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using sqlite run store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite run store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Run store db_path set but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory run store");
    Arc::new(MemoryRunStore::new())
}
