//! 科室轮询记录
//!
//! 前端根据最近一次成功时间判断科室是否处于降级状态。

use crate::connection::DatabasePool;
use crate::models::DbDepartmentTick;
use chrono::{DateTime, Utc};
use gfr_core::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct TickJournal {
    db: DatabasePool,
}

impl TickJournal {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    /// 记录一次成功的轮询
    pub async fn record_success(&self, department: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO department_ticks (department, last_attempt, last_success, last_error)
            VALUES (?1, ?2, ?2, NULL)
            ON CONFLICT(department) DO UPDATE SET
                last_attempt = excluded.last_attempt,
                last_success = excluded.last_success,
                last_error = NULL
        "#,
        )
        .bind(department)
        .bind(at)
        .execute(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }

    /// 记录一次失败的轮询，保留上一次成功时间
    pub async fn record_failure(&self, department: &str, at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO department_ticks (department, last_attempt, last_success, last_error)
            VALUES (?1, ?2, NULL, ?3)
            ON CONFLICT(department) DO UPDATE SET
                last_attempt = excluded.last_attempt,
                last_error = excluded.last_error
        "#,
        )
        .bind(department)
        .bind(at)
        .bind(error)
        .execute(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, department: &str) -> Result<Option<DbDepartmentTick>> {
        sqlx::query_as::<_, DbDepartmentTick>(
            "SELECT department, last_attempt, last_success, last_error FROM department_ticks WHERE department = ?1",
        )
        .bind(department)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }

    pub async fn all(&self) -> Result<Vec<DbDepartmentTick>> {
        sqlx::query_as::<_, DbDepartmentTick>(
            "SELECT department, last_attempt, last_success, last_error FROM department_ticks ORDER BY department",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }
}
