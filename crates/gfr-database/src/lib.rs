//! # GFR数据库模块
//!
//! 已处理检查台账与科室轮询记录，基于 SQLite。

pub mod connection;
pub mod journal;
pub mod ledger;
pub mod models;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use journal::TickJournal;
pub use ledger::{HandledLedger, SqlLedger};
pub use models::*;
