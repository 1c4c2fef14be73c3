//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

/// 已处理检查表
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DbHandledExamination {
    pub accession_number: String,
    pub handle_day: NaiveDate,
}

/// 科室轮询记录表
#[derive(Debug, Clone, FromRow)]
pub struct DbDepartmentTick {
    pub department: String,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DbDepartmentTick {
    /// 最近一次尝试是否失败
    pub fn is_degraded(&self) -> bool {
        match self.last_success {
            Some(success) => success < self.last_attempt && self.last_error.is_some(),
            None => true,
        }
    }
}
