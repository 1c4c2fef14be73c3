//! DIMSE 状态码

/// 成功
pub const STATUS_SUCCESS: u16 = 0x0000;
/// 重复的 SOP 实例
pub const STATUS_DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
/// 不支持的 SOP 类，监听器用它拒绝 C-MOVE
pub const STATUS_SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
/// 无法识别的操作
pub const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;
/// 资源不足
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
/// 无法理解（例如缺少检查号）
pub const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;
/// 已取消
pub const STATUS_CANCEL: u16 = 0xFE00;
/// 待续
pub const STATUS_PENDING: u16 = 0xFF00;
/// 待续，有可选键不支持
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;

/// 查询/迁移响应状态的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Pending,
    Success,
    Cancelled,
    Failure(u16),
}

impl DimseStatus {
    /// 是否是序列的最后一个响应
    pub fn is_final(&self) -> bool {
        !matches!(self, DimseStatus::Pending)
    }
}

/// 将状态码分类；未知的非零状态一律视为失败
pub fn classify(code: u16) -> DimseStatus {
    match code {
        STATUS_PENDING | STATUS_PENDING_WARNING => DimseStatus::Pending,
        STATUS_SUCCESS => DimseStatus::Success,
        STATUS_CANCEL => DimseStatus::Cancelled,
        other => DimseStatus::Failure(other),
    }
}

/// C-STORE 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    Success,
    Duplicate,
    OutOfResources,
    UnknownFailure(u16),
}

impl TransmitStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            STATUS_SUCCESS => TransmitStatus::Success,
            STATUS_DUPLICATE_SOP_INSTANCE => TransmitStatus::Duplicate,
            c if c & 0xFF00 == 0xA700 => TransmitStatus::OutOfResources,
            other => TransmitStatus::UnknownFailure(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            TransmitStatus::Success => STATUS_SUCCESS,
            TransmitStatus::Duplicate => STATUS_DUPLICATE_SOP_INSTANCE,
            TransmitStatus::OutOfResources => STATUS_OUT_OF_RESOURCES,
            TransmitStatus::UnknownFailure(code) => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0xFF00), DimseStatus::Pending);
        assert_eq!(classify(0xFF01), DimseStatus::Pending);
        assert_eq!(classify(0x0000), DimseStatus::Success);
        assert_eq!(classify(0xFE00), DimseStatus::Cancelled);
        assert_eq!(classify(0xA900), DimseStatus::Failure(0xA900));
        assert!(!classify(0xFF00).is_final());
        assert!(classify(0xC000).is_final());
    }

    #[test]
    fn test_transmit_status() {
        assert_eq!(TransmitStatus::from_code(0x0000), TransmitStatus::Success);
        assert_eq!(TransmitStatus::from_code(0x0111), TransmitStatus::Duplicate);
        assert_eq!(TransmitStatus::from_code(0xA701), TransmitStatus::OutOfResources);
        assert_eq!(
            TransmitStatus::from_code(0xC000),
            TransmitStatus::UnknownFailure(0xC000)
        );
    }
}
