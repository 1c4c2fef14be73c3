//! 已处理检查台账

use crate::connection::DatabasePool;
use crate::models::DbHandledExamination;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use gfr_core::{Result, SyncError};
use tracing::{debug, info};

/// 已处理检查台账
///
/// 一旦登记，该检查号不会再从 RIS 拉取，即使 RIS 仍报告为已预约。
#[async_trait]
pub trait HandledLedger: Send + Sync {
    /// 登记检查号，已存在时更新处理日期
    async fn mark_handled(&self, accession_number: &str, day: NaiveDate) -> Result<()>;

    async fn is_handled(&self, accession_number: &str) -> Result<bool>;

    /// 删除处理日期距今超过保留天数的条目，返回删除数量
    async fn sweep_older_than(&self, today: NaiveDate, days: i64) -> Result<u64>;
}

/// 基于 SQLite 的台账
#[derive(Debug, Clone)]
pub struct SqlLedger {
    db: DatabasePool,
}

impl SqlLedger {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    /// 按处理日期列出所有条目
    pub async fn entries(&self) -> Result<Vec<DbHandledExamination>> {
        sqlx::query_as::<_, DbHandledExamination>(
            "SELECT accession_number, handle_day FROM handled_examinations ORDER BY handle_day, accession_number",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }
}

#[async_trait]
impl HandledLedger for SqlLedger {
    async fn mark_handled(&self, accession_number: &str, day: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO handled_examinations (accession_number, handle_day)
            VALUES (?1, ?2)
            ON CONFLICT(accession_number) DO UPDATE SET handle_day = excluded.handle_day
        "#,
        )
        .bind(accession_number)
        .bind(day)
        .execute(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        debug!(accession = %accession_number, "登记为已处理 ({})", day);
        Ok(())
    }

    async fn is_handled(&self, accession_number: &str) -> Result<bool> {
        let found: Option<(String,)> = sqlx::query_as(
            "SELECT accession_number FROM handled_examinations WHERE accession_number = ?1",
        )
        .bind(accession_number)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(found.is_some())
    }

    async fn sweep_older_than(&self, today: NaiveDate, days: i64) -> Result<u64> {
        let cutoff = today - Duration::days(days);
        let result = sqlx::query("DELETE FROM handled_examinations WHERE handle_day < ?1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("台账清理: 删除 {} 条早于 {} 的记录", removed, cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> (tempfile::TempDir, SqlLedger) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.sqlite3").display());
        let db = DatabasePool::connect(&url, 2).await.unwrap();
        (dir, SqlLedger::new(db))
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_mark_and_query() {
        let (_dir, ledger) = ledger().await;
        assert!(!ledger.is_handled("REGH001").await.unwrap());

        ledger.mark_handled("REGH001", day(2024, 6, 1)).await.unwrap();
        assert!(ledger.is_handled("REGH001").await.unwrap());

        // 重复登记只更新日期
        ledger.mark_handled("REGH001", day(2024, 6, 3)).await.unwrap();
        let entries = ledger.entries().await.unwrap();
        assert_eq!(
            entries,
            vec![DbHandledExamination {
                accession_number: "REGH001".into(),
                handle_day: day(2024, 6, 3),
            }]
        );
    }

    #[tokio::test]
    async fn test_sweep_removes_entries_past_window() {
        let (_dir, ledger) = ledger().await;
        let today = day(2024, 6, 30);
        ledger.mark_handled("REGH002", today - Duration::days(20)).await.unwrap();
        ledger.mark_handled("REGH003", today - Duration::days(14)).await.unwrap();
        ledger.mark_handled("REGH004", today).await.unwrap();

        let removed = ledger.sweep_older_than(today, 14).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!ledger.is_handled("REGH002").await.unwrap());
        assert!(ledger.is_handled("REGH003").await.unwrap());
        assert!(ledger.is_handled("REGH004").await.unwrap());
    }
}
