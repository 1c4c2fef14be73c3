//! 历史检查获取
//!
//! 按患者号查询 PACS，对每个匹配发起迁移，目的地是本服务的监听端。迁移来的对象由
//! 监听端写入落地目录，再移入新检查的目录作为历史检查。

use gfr_core::{Result, SyncError};
use gfr_dicom::record::{history_query, relocate_query};
use gfr_dicom::{DecodeMode, DimseSession, DimseStatus, ExamRecord};
use gfr_storage::ExaminationStore;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 落地文件的检查间隔
const MATERIALIZE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct HistoryFetcher {
    store: ExaminationStore,
    /// 迁移目的地，即监听端的 AE 标题
    destination: String,
    materialize_timeout: Duration,
}

impl HistoryFetcher {
    pub fn new(
        store: ExaminationStore,
        destination: impl Into<String>,
        materialize_timeout: Duration,
    ) -> Self {
        Self {
            store,
            destination: destination.into(),
            materialize_timeout,
        }
    }

    /// 获取患者的历史检查，返回成功加入的数量
    ///
    /// 单个迁移失败只记录日志，不影响其余匹配和主检查。
    pub async fn fetch(
        &self,
        query: &mut dyn DimseSession,
        relocate: &mut dyn DimseSession,
        hospital: &str,
        primary: &ExamRecord,
    ) -> Result<usize> {
        let (accession, patient) = primary.identity()?;
        let matches = self.find_matches(query, patient, accession).await?;
        if matches.is_empty() {
            debug!(accession = %accession, "没有历史检查");
            return Ok(0);
        }

        let mut adopted = 0;
        // 同一关联上的迁移请求严格依次进行
        for historic in &matches {
            let Some(historic_accession) = historic.accession_number.as_deref() else {
                continue;
            };
            match self
                .relocate_one(relocate, hospital, accession, historic_accession, historic)
                .await
            {
                Ok(()) => adopted += 1,
                Err(e) => {
                    warn!(
                        accession = %accession,
                        "历史检查 {} 获取失败，已跳过: {}",
                        historic_accession,
                        e
                    );
                }
            }
        }

        info!(
            accession = %accession,
            "历史检查: {}/{} 个已加入",
            adopted,
            matches.len()
        );
        Ok(adopted)
    }

    /// 查询同一患者的其他检查
    async fn find_matches(
        &self,
        query: &mut dyn DimseSession,
        patient: &str,
        primary: &str,
    ) -> Result<Vec<ExamRecord>> {
        query.begin_find(&history_query(patient)).await?;

        let mut matches = Vec::new();
        while let Some(response) = query.next_response().await {
            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_decode() => {
                    warn!("丢弃无法解码的历史查询结果: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if response.status != DimseStatus::Pending {
                continue;
            }
            let Some(identifier) = response.identifier else {
                continue;
            };
            match ExamRecord::from_object(&identifier, DecodeMode::Strict) {
                Ok(record) => {
                    let usable = record
                        .accession_number
                        .as_deref()
                        .is_some_and(|acc| acc != primary && !acc.is_empty());
                    if usable {
                        matches.push(record);
                    }
                }
                Err(e) => warn!("丢弃无法解析的历史查询结果: {}", e),
            }
        }
        Ok(matches)
    }

    async fn relocate_one(
        &self,
        relocate: &mut dyn DimseSession,
        hospital: &str,
        primary: &str,
        historic_accession: &str,
        historic: &ExamRecord,
    ) -> Result<()> {
        let identifier = relocate_query(historic)?;
        relocate
            .begin_relocate(&self.destination, &identifier)
            .await?;
        // 最终响应说明没有任何对象发出时不必等待
        let mut delivered = true;
        while let Some(response) = relocate.next_response().await {
            let response = response?;
            if !response.status.is_final() {
                continue;
            }
            let failed = response.failed.unwrap_or(0);
            if failed > 0 {
                debug!(accession = %primary, "迁移子操作失败 {} 个", failed);
            }
            delivered = failed == 0 && response.completed != Some(0);
        }
        if !delivered && !tokio::fs::try_exists(self.store.landing_path(historic_accession)).await? {
            return Err(SyncError::NotFound(format!(
                "PACS 未发送 {historic_accession}"
            )));
        }

        self.wait_for_landing(historic_accession).await?;
        self.store
            .adopt_historic(hospital, primary, historic_accession)
            .await?;
        Ok(())
    }

    /// 等待迁移来的对象出现在落地目录
    async fn wait_for_landing(&self, accession_number: &str) -> Result<()> {
        let path = self.store.landing_path(accession_number);
        let deadline = Instant::now() + self.materialize_timeout;
        loop {
            if tokio::fs::try_exists(&path).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout(format!(
                    "{accession_number} 未在 {:?} 内到达",
                    self.materialize_timeout
                )));
            }
            tokio::time::sleep(MATERIALIZE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{historic, new_session, FakeConnector, Script, PACS_AE};
    use gfr_core::StoreState;

    async fn setup(script: impl FnOnce(&mut Script)) -> (
        tempfile::TempDir,
        ExaminationStore,
        FakeConnector,
        ExamRecord,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = ExaminationStore::new(dir.path().join("data"), dir.path().join("images"));
        store.init().await.unwrap();

        let primary = historic("REGH010", "0101011234", "1.2.3.10");
        let mut s = Script::default();
        s.landing = Some(store.landing_dir().to_path_buf());
        s.records.insert(
            PACS_AE.into(),
            vec![
                primary.clone(),
                historic("REGH001", "0101011234", "1.2.3.1"),
                historic("REGH002", "0101011234", "1.2.3.2"),
                historic("OTHER01", "9999999999", "1.2.3.9"),
            ],
        );
        script(&mut s);

        store
            .put(StoreState::Active, "RH", "REGH010", &primary, false)
            .await
            .unwrap();
        (dir, store, FakeConnector::new(s), primary)
    }

    #[tokio::test]
    async fn test_fetch_adopts_matches_as_siblings() {
        let (_dir, store, connector, primary) = setup(|_| {}).await;
        let fetcher = HistoryFetcher::new(store.clone(), "GFRCALC", Duration::from_secs(1));
        let mut query = new_session(&connector, PACS_AE);
        let mut relocate = new_session(&connector, PACS_AE);

        let adopted = fetcher
            .fetch(&mut query, &mut relocate, "RH", &primary)
            .await
            .unwrap();
        assert_eq!(adopted, 2);

        let dir = store.entry_dir(StoreState::Active, "RH", "REGH010");
        assert!(dir.join("REGH001.dcm").exists());
        assert!(dir.join("REGH002.dcm").exists());
        assert!(!dir.join("OTHER01.dcm").exists());
        assert_eq!(
            connector.log.count("relocate PACS"),
            2,
            "{:?}",
            connector.log.entries()
        );
        assert!(connector
            .log
            .entries()
            .iter()
            .any(|e| e == "relocate PACS REGH001 -> GFRCALC"));
    }

    #[tokio::test]
    async fn test_failed_relocate_does_not_stop_others() {
        let (_dir, store, connector, primary) = setup(|s| {
            s.relocate_failures.insert("REGH001".into());
        })
        .await;
        let fetcher = HistoryFetcher::new(store.clone(), "GFRCALC", Duration::from_secs(1));
        let mut query = new_session(&connector, PACS_AE);
        let mut relocate = new_session(&connector, PACS_AE);

        let adopted = fetcher
            .fetch(&mut query, &mut relocate, "RH", &primary)
            .await
            .unwrap();
        assert_eq!(adopted, 1);
        let dir = store.entry_dir(StoreState::Active, "RH", "REGH010");
        assert!(!dir.join("REGH001.dcm").exists());
        assert!(dir.join("REGH002.dcm").exists());
        assert!(dir.join("REGH010.dcm").exists());
    }

    #[tokio::test]
    async fn test_undecodable_match_is_skipped() {
        let (_dir, store, connector, primary) = setup(|s| {
            s.undecodable.insert(PACS_AE.into());
        })
        .await;
        let fetcher = HistoryFetcher::new(store.clone(), "GFRCALC", Duration::from_secs(1));
        let mut query = new_session(&connector, PACS_AE);
        let mut relocate = new_session(&connector, PACS_AE);

        let adopted = fetcher
            .fetch(&mut query, &mut relocate, "RH", &primary)
            .await
            .unwrap();
        assert_eq!(adopted, 2);

        // 同一关联可以继续查询下一个患者
        let next = historic("REGH020", "5555555555", "1.2.3.20");
        assert_eq!(
            fetcher
                .fetch(&mut query, &mut relocate, "RH", &next)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_empty_relocate_returns_without_waiting() {
        let (_dir, store, connector, primary) = setup(|s| {
            s.relocate_empty.insert("REGH001".into());
        })
        .await;
        let fetcher = HistoryFetcher::new(store.clone(), "GFRCALC", Duration::from_secs(10));
        let mut query = new_session(&connector, PACS_AE);
        let mut relocate = new_session(&connector, PACS_AE);

        let started = std::time::Instant::now();
        let adopted = fetcher
            .fetch(&mut query, &mut relocate, "RH", &primary)
            .await
            .unwrap();
        assert_eq!(adopted, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        let dir = store.entry_dir(StoreState::Active, "RH", "REGH010");
        assert!(!dir.join("REGH001.dcm").exists());
        assert!(dir.join("REGH002.dcm").exists());
    }

    #[tokio::test]
    async fn test_missing_object_times_out() {
        let (_dir, store, connector, primary) = setup(|s| {
            s.landing = None;
        })
        .await;
        let fetcher = HistoryFetcher::new(store.clone(), "GFRCALC", Duration::from_millis(300));
        let mut query = new_session(&connector, PACS_AE);
        let mut relocate = new_session(&connector, PACS_AE);

        let started = std::time::Instant::now();
        let adopted = fetcher
            .fetch(&mut query, &mut relocate, "RH", &primary)
            .await
            .unwrap();
        assert_eq!(adopted, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
