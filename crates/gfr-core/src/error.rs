//! 错误定义模块

use thiserror::Error;

/// 关联建立失败的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("关联参数无效: {0}")]
    InvalidParameters(String),

    #[error("连接被拒绝: {0}")]
    ConnectionRefused(String),

    #[error("表示上下文被拒绝: {0}")]
    ContextRejected(String),

    #[error("关联超时: {0}")]
    Timeout(String),
}

/// 同步系统统一错误类型
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("{operation} 返回失败状态: {status:#06x}")]
    ProtocolStatus { operation: String, status: u16 },

    #[error("DICOM协议错误: {0}")]
    Dicom(String),

    #[error("DICOM解码错误: {0}")]
    Decode(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("基础目录不可用: {0}")]
    BaseDirectory(String),

    #[error("已存在: {0}")]
    AlreadyExists(String),

    #[error("状态冲突: {0}")]
    Conflict(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl SyncError {
    /// 是否应当升级为进程级致命错误（基础目录或台账不可用）
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::BaseDirectory(_) | SyncError::Database(_))
    }

    /// 重复写入，由调用方决定覆盖或跳过
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SyncError::AlreadyExists(_) | SyncError::Conflict(_))
    }

    /// 单条记录无法解码；丢弃该记录，响应序列继续
    pub fn is_decode(&self) -> bool {
        matches!(self, SyncError::Decode(_))
    }
}

/// 同步系统统一结果类型
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::BaseDirectory("/data/active".into()).is_fatal());
        assert!(SyncError::Database("locked".into()).is_fatal());
        assert!(!SyncError::Storage("rename failed".into()).is_fatal());
        assert!(!SyncError::from(ConnectionError::Timeout("RIS".into())).is_fatal());
    }

    #[test]
    fn test_decode_classification() {
        assert!(SyncError::Decode("bad dataset".into()).is_decode());
        assert!(!SyncError::Dicom("closed".into()).is_decode());
    }

    #[test]
    fn test_protocol_status_message() {
        let err = SyncError::ProtocolStatus {
            operation: "C-FIND".into(),
            status: 0xA700,
        };
        assert!(err.to_string().contains("0xa700"));
    }
}
