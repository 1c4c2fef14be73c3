//! 数据库连接管理

use gfr_core::{Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// 数据库连接池
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// 连接数据库，文件不存在时创建，并建立所需的表
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| SyncError::Database(format!("数据库地址无效 {url}: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| SyncError::Database(format!("无法连接数据库 {url}: {e}")))?;

        let db = Self { pool };
        db.create_tables().await?;
        info!("数据库已连接: {}", url);
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建数据库表
    async fn create_tables(&self) -> Result<()> {
        // 已处理检查台账
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS handled_examinations (
                accession_number TEXT PRIMARY KEY NOT NULL,
                handle_day TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        // 科室轮询记录
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS department_ticks (
                department TEXT PRIMARY KEY NOT NULL,
                last_attempt TEXT NOT NULL,
                last_success TEXT,
                last_error TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_handled_examinations_handle_day ON handled_examinations(handle_day)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
