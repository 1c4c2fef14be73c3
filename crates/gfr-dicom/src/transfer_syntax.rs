//! 传输语法与服务上下文
//!
//! 关联协商只使用两种未压缩的小端传输语法；命令集固定使用隐式VR小端。

use dicom::encoding::{TransferSyntax, TransferSyntaxIndex};
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use gfr_core::{Result, SyncError};
use tracing::warn;

/// 常用传输语法UID
pub mod transfer_syntax_uids {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
}

/// 本系统使用的SOP类UID
pub mod sop_class_uids {
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";
    pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
    pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
    pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
    pub const ENCAPSULATED_PDF_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.104.1";
    pub const COMPUTED_RADIOGRAPHY_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
    pub const NM_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.20";
    pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const BASIC_TEXT_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.11";
}

/// 应用上下文名
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// 入站监听器接受的存储类
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    sop_class_uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    sop_class_uids::ENCAPSULATED_PDF_STORAGE,
    sop_class_uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    sop_class_uids::NM_IMAGE_STORAGE,
    sop_class_uids::CT_IMAGE_STORAGE,
    sop_class_uids::MR_IMAGE_STORAGE,
    sop_class_uids::BASIC_TEXT_SR_STORAGE,
];

/// 一次关联协商的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceContext {
    /// C-FIND (Study Root)
    Query,
    /// C-MOVE (Study Root)
    Relocate,
    /// C-STORE，指定存储类
    Transmit { sop_class_uid: String },
    /// C-ECHO
    Verification,
}

impl ServiceContext {
    /// 该操作对应的抽象语法
    pub fn abstract_syntax(&self) -> &str {
        match self {
            ServiceContext::Query => sop_class_uids::STUDY_ROOT_FIND,
            ServiceContext::Relocate => sop_class_uids::STUDY_ROOT_MOVE,
            ServiceContext::Transmit { sop_class_uid } => sop_class_uid,
            ServiceContext::Verification => sop_class_uids::VERIFICATION,
        }
    }
}

/// 传输语法管理器
pub struct TransferSyntaxManager;

impl TransferSyntaxManager {
    /// 请求关联时提议的传输语法，按优先级排序
    pub fn proposed() -> Vec<String> {
        vec![
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ]
    }

    /// 检查传输语法是否支持
    pub fn is_supported(uid: &str) -> bool {
        matches!(
            trim_uid(uid),
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN
                | transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN
        )
    }

    /// 从对方提议的列表中选择一个我们支持的，优先显式VR
    pub fn select<'a, I>(offered: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let offered: Vec<&str> = offered.into_iter().map(|s| trim_uid(s)).collect();
        [
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
            transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN,
        ]
        .into_iter()
        .find(|ours| offered.contains(ours))
        .map(str::to_string)
    }

    /// 按指定传输语法编码数据集（不含文件头）
    pub fn encode_dataset(obj: &InMemDicomObject, uid: &str) -> Result<Vec<u8>> {
        let registry = TransferSyntaxRegistry;
        let ts = Self::lookup(&registry, uid)?;
        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, ts)
            .map_err(|e| SyncError::Dicom(format!("无法编码数据集: {e}")))?;
        Ok(buffer)
    }

    /// 按指定传输语法解码数据集
    pub fn decode_dataset(data: &[u8], uid: &str) -> Result<InMemDicomObject> {
        let registry = TransferSyntaxRegistry;
        let ts = Self::lookup(&registry, uid)?;
        InMemDicomObject::read_dataset_with_ts(data, ts)
            .map_err(|e| SyncError::Decode(format!("无法解码数据集: {e}")))
    }

    fn lookup<'r>(registry: &'r TransferSyntaxRegistry, uid: &str) -> Result<&'r TransferSyntax> {
        let uid = trim_uid(uid);
        if !Self::is_supported(uid) {
            warn!("不支持的传输语法: {}", uid);
            return Err(SyncError::Dicom(format!("不支持的传输语法: {uid}")));
        }
        registry
            .get(uid)
            .ok_or_else(|| SyncError::Dicom(format!("传输语法未注册: {uid}")))
    }
}

/// 去掉UID末尾的填充字符
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(&['\0', ' '][..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::tags;

    #[test]
    fn test_transfer_syntax_selection() {
        let offered = vec![
            "1.2.840.10008.1.2.4.50".to_string(),
            format!("{}\0", transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN),
        ];
        assert_eq!(
            TransferSyntaxManager::select(&offered).as_deref(),
            Some(transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN)
        );

        let offered = TransferSyntaxManager::proposed();
        assert_eq!(
            TransferSyntaxManager::select(&offered).as_deref(),
            Some(transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN)
        );

        assert_eq!(TransferSyntaxManager::select(&["1.2.3".to_string()]), None);
    }

    #[test]
    fn test_dataset_codec_in_both_syntaxes() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::ACCESSION_NUMBER,
            VR::SH,
            PrimitiveValue::from("REGH001"),
        ));

        for uid in [
            transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN,
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
        ] {
            let bytes = TransferSyntaxManager::encode_dataset(&obj, uid).unwrap();
            let decoded = TransferSyntaxManager::decode_dataset(&bytes, uid).unwrap();
            let value = decoded.element(tags::ACCESSION_NUMBER).unwrap().to_str().unwrap();
            assert_eq!(value.trim(), "REGH001");
        }
    }

    #[test]
    fn test_service_context_abstract_syntax() {
        assert_eq!(
            ServiceContext::Query.abstract_syntax(),
            sop_class_uids::STUDY_ROOT_FIND
        );
        let transmit = ServiceContext::Transmit {
            sop_class_uid: sop_class_uids::NM_IMAGE_STORAGE.into(),
        };
        assert_eq!(transmit.abstract_syntax(), sop_class_uids::NM_IMAGE_STORAGE);
        assert!(!TransferSyntaxManager::is_supported("1.2.840.10008.1.2.2"));
    }
}
