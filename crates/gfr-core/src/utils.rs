//! 通用工具函数

use crate::error::{Result, SyncError};
use chrono::Utc;
use uuid::Uuid;

/// 本系统的 UID 根
pub const UID_ROOT: &str = "1.2.826.0.1.3680043.9.7382";

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    // UUID 的 128 位整数形式保证各段都是纯数字
    let uid = format!(
        "{}.{}.{}",
        UID_ROOT,
        Utc::now().timestamp(),
        Uuid::new_v4().as_u128()
    );
    uid.chars().take(64).collect::<String>().trim_end_matches('.').to_string()
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.len() <= 64 && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// 验证AE标题：1-16个可打印ASCII字符，不能全为空格，不能包含反斜杠
pub fn is_valid_ae_title(ae_title: &str) -> bool {
    !ae_title.trim().is_empty()
        && ae_title.len() <= 16
        && ae_title.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\')
}

/// 检查号会直接用作目录名，必须拒绝路径分隔符和点
pub fn validate_accession_number(accession: &str) -> Result<()> {
    let trimmed = accession.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation("empty accession number".into()));
    }
    if trimmed.len() != accession.len()
        || accession
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '.' || c.is_control())
    {
        return Err(SyncError::Validation(format!(
            "accession number {accession:?} is not usable as a directory name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
        assert!(uid.starts_with(UID_ROOT));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
    }

    #[test]
    fn test_ae_title() {
        assert!(is_valid_ae_title("RH_EDTA"));
        assert!(!is_valid_ae_title(""));
        assert!(!is_valid_ae_title("    "));
        assert!(!is_valid_ae_title("THIS_TITLE_IS_TOO_LONG"));
        assert!(!is_valid_ae_title("BAD\\AE"));
    }

    #[test]
    fn test_accession_number_safety() {
        assert!(validate_accession_number("REGH001").is_ok());
        assert!(validate_accession_number("").is_err());
        assert!(validate_accession_number("../etc").is_err());
        assert!(validate_accession_number("REG/H1").is_err());
        assert!(validate_accession_number(" REGH1").is_err());
    }
}
