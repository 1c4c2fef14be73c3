//! 入站服务实现

use crate::record::write_object_file;
use crate::status::STATUS_SOP_CLASS_NOT_SUPPORTED;
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use gfr_core::utils::validate_accession_number;
use gfr_core::{Result, SyncError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 入站请求处理
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// 收到 C-STORE；本地持久化成功后才返回 Ok
    async fn on_transmit(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        obj: InMemDicomObject,
    ) -> Result<()>;

    /// 收到 C-MOVE，返回响应状态码
    async fn on_relocate_request(&self, identifier: Option<&InMemDicomObject>, destination: &str)
        -> u16;
}

/// 将收到的对象按检查号写入落地目录
#[derive(Debug, Clone)]
pub struct LandingStore {
    dir: PathBuf,
}

impl LandingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 落地文件路径
    pub fn path_for(&self, accession_number: &str) -> PathBuf {
        self.dir.join(format!("{accession_number}.dcm"))
    }

    /// 对象自带的检查号，落地文件以它命名
    pub fn accession_of(obj: &InMemDicomObject) -> Result<String> {
        let accession = obj
            .element(tags::ACCESSION_NUMBER)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        validate_accession_number(&accession)?;
        Ok(accession)
    }
}

#[async_trait]
impl InboundHandler for LandingStore {
    async fn on_transmit(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        obj: InMemDicomObject,
    ) -> Result<()> {
        let accession = Self::accession_of(&obj)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path_for(&accession);
        let partial = self.dir.join(format!("{accession}.dcm.partial"));

        let write_path = partial.clone();
        let sop_class = sop_class_uid.to_string();
        let sop_instance = sop_instance_uid.to_string();
        tokio::task::spawn_blocking(move || {
            write_object_file(&write_path, obj, &sop_class, &sop_instance)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("写入任务失败: {e}")))??;

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(SyncError::Storage(format!(
                "无法移动到 {}: {e}",
                target.display()
            )));
        }

        info!(accession = %accession, "入站对象已落地: {}", target.display());
        Ok(())
    }

    async fn on_relocate_request(
        &self,
        _identifier: Option<&InMemDicomObject>,
        destination: &str,
    ) -> u16 {
        warn!("拒绝迁移请求 (目的 {}): 本服务不是迁移源", destination);
        STATUS_SOP_CLASS_NOT_SUPPORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::read_record_file;
    use dicom::core::{DataElement, PrimitiveValue, VR};

    fn object(accession: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::ACCESSION_NUMBER,
            VR::SH,
            PrimitiveValue::from(accession),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("0101011234"),
        ));
        obj
    }

    #[tokio::test]
    async fn test_transmit_lands_by_accession() {
        let dir = tempfile::tempdir().unwrap();
        let store = LandingStore::new(dir.path().join("landing"));
        store
            .on_transmit("1.2.840.10008.5.1.4.1.1.7", "1.2.3.4", object("REGH010"))
            .await
            .unwrap();

        let landed = read_record_file(&store.path_for("REGH010")).unwrap();
        assert_eq!(landed.patient_id.as_deref(), Some("0101011234"));
        assert!(!store.dir().join("REGH010.dcm.partial").exists());
    }

    #[tokio::test]
    async fn test_transmit_without_usable_accession_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LandingStore::new(dir.path());
        let err = store
            .on_transmit("1.2.840.10008.5.1.4.1.1.7", "1.2.3.5", object("../x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_relocate_is_never_supported() {
        let dir = tempfile::tempdir().unwrap();
        let store = LandingStore::new(dir.path());
        let status = store.on_relocate_request(None, "ELSEWHERE").await;
        assert_eq!(status, STATUS_SOP_CLASS_NOT_SUPPORTED);
    }
}
