//! # GFR工作流模块
//!
//! RIS 轮询的核心流程：
//! - 轮询引擎：按科室查询 RIS，去重后保存新检查
//! - 历史检查：从 PACS 迁移同一患者的既往检查
//! - 轮询服务：后台任务，支持取消

pub mod departments;
pub mod engine;
pub mod history;
pub mod service;

#[cfg(test)]
mod testing;

// 重新导出主要类型
pub use departments::{DepartmentDirectory, StaticDepartments};
pub use engine::{BookingOutcome, PollerSettings, PollerState, RisPoller, TickReport};
pub use history::HistoryFetcher;
pub use service::PollerService;
