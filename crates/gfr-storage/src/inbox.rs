//! 入站对象写入落地目录

use crate::storage::ExaminationStore;
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use gfr_core::Result;
use gfr_dicom::{InboundHandler, LandingStore};

/// 监听端使用的入站处理：按检查号加锁后写入存储的落地目录
#[derive(Debug, Clone)]
pub struct LandingInbox {
    store: ExaminationStore,
    landing: LandingStore,
}

impl LandingInbox {
    pub fn new(store: ExaminationStore) -> Self {
        let landing = LandingStore::new(store.landing_dir());
        Self { store, landing }
    }
}

#[async_trait]
impl InboundHandler for LandingInbox {
    async fn on_transmit(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        obj: InMemDicomObject,
    ) -> Result<()> {
        let accession = LandingStore::accession_of(&obj)?;
        let _guard = self.store.lock_landing(&accession).await;
        self.landing
            .on_transmit(sop_class_uid, sop_instance_uid, obj)
            .await
    }

    async fn on_relocate_request(
        &self,
        identifier: Option<&InMemDicomObject>,
        destination: &str,
    ) -> u16 {
        self.landing.on_relocate_request(identifier, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfr_core::StoreState;
    use gfr_dicom::ExamRecord;
    use std::time::Duration;

    fn object(accession: &str) -> InMemDicomObject {
        ExamRecord {
            accession_number: Some(accession.into()),
            patient_id: Some("0101011234".into()),
            ..Default::default()
        }
        .to_object()
    }

    async fn store() -> (tempfile::TempDir, ExaminationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ExaminationStore::new(dir.path().join("data"), dir.path().join("images"));
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_transmit_waits_for_landing_lock() {
        let (_dir, store) = store().await;
        let inbox = LandingInbox::new(store.clone());

        let guard = store.lock_landing("REGH001").await;
        let pending = tokio::spawn({
            let inbox = inbox.clone();
            async move {
                inbox
                    .on_transmit("1.2.840.10008.5.1.4.1.1.7", "1.2.3.4", object("REGH001"))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert!(!store.landing_path("REGH001").exists());

        drop(guard);
        pending.await.unwrap().unwrap();
        assert!(store.landing_path("REGH001").exists());
    }

    #[tokio::test]
    async fn test_transmitted_object_can_be_adopted() {
        let (_dir, store) = store().await;
        let inbox = LandingInbox::new(store.clone());
        let primary = ExamRecord {
            accession_number: Some("REGH010".into()),
            patient_id: Some("0101011234".into()),
            ..Default::default()
        };
        store
            .put(StoreState::Active, "RH", "REGH010", &primary, false)
            .await
            .unwrap();

        inbox
            .on_transmit("1.2.840.10008.5.1.4.1.1.7", "1.2.3.4", object("REGH001"))
            .await
            .unwrap();
        let path = store.adopt_historic("RH", "REGH010", "REGH001").await.unwrap();
        assert!(path.exists());
        assert!(!store.landing_path("REGH001").exists());
    }
}
