//! # GFR存储模块
//!
//! 按状态管理检查目录、入站落地目录以及缓存清理。

pub mod inbox;
pub mod lifecycle;
mod locks;
pub mod storage;

pub use inbox::LandingInbox;
pub use lifecycle::Eviction;
pub use storage::{ExaminationStore, Listing, StoredExamination, LANDING_DIR, RECOVERED_MARKER};
