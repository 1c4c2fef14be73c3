//! 数据生命周期管理

use crate::storage::{marker_date, ExaminationStore, RECOVERED_MARKER};
use chrono::NaiveDate;
use gfr_core::{Result, StoreState};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// 一次清理的结果；单个条目失败只计数，不中断清理
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub removed: usize,
    pub failed: usize,
}

impl ExaminationStore {
    /// 清理搜索缓存
    ///
    /// 有效日期取检查日期与恢复日期中较晚的一个，超过保留天数的检查被删除。
    /// 没有任何日期的检查保留。
    pub async fn evict_cache(&self, today: NaiveDate, retention_days: i64) -> Result<Eviction> {
        let mut result = Eviction::default();
        for hospital in self.hospitals(StoreState::Cached).await? {
            let mut listing = self.list_all(StoreState::Cached, &hospital).await?;
            while let Some(entry) = listing.next().await {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("跳过无法读取的缓存检查 ({}): {}", hospital, e);
                        result.failed += 1;
                        continue;
                    }
                };

                let recovered = match marker_date(&entry.dir.join(RECOVERED_MARKER)).await {
                    Ok(date) => date,
                    Err(e) => {
                        warn!(accession = %entry.accession_number, "无法读取恢复标记: {}", e);
                        result.failed += 1;
                        continue;
                    }
                };
                let effective = match (entry.record.scheduled_date(), recovered) {
                    (Some(a), Some(b)) => a.max(b),
                    (Some(d), None) | (None, Some(d)) => d,
                    (None, None) => continue,
                };
                if (today - effective).num_days() <= retention_days {
                    continue;
                }

                match self
                    .remove(StoreState::Cached, &hospital, &entry.accession_number)
                    .await
                {
                    Ok(()) => {
                        debug!(accession = %entry.accession_number, "缓存过期已删除 ({})", effective);
                        result.removed += 1;
                    }
                    Err(e) => {
                        warn!(accession = %entry.accession_number, "缓存过期但无法删除: {}", e);
                        result.failed += 1;
                    }
                }
            }
        }
        if result.removed > 0 || result.failed > 0 {
            info!(
                "缓存清理完成: 删除 {} 个检查，失败 {} 个",
                result.removed, result.failed
            );
        }
        Ok(result)
    }

    /// 删除落地目录中早于 `max_age` 的文件
    ///
    /// 迟到的迁移对象、未被移入的重复对象和主动推送的对象都会留在落地目录。
    pub async fn sweep_landing(&self, now: SystemTime, max_age: Duration) -> Result<Eviction> {
        let cutoff = now.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut result = Eviction::default();
        let mut entries = tokio::fs::read_dir(self.landing_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = match entry.metadata().await {
                Ok(metadata) if !metadata.is_file() => continue,
                Ok(metadata) => metadata.modified(),
                Err(e) => Err(e),
            };
            match modified {
                Ok(modified) if modified >= cutoff => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("无法读取落地文件 {}: {}", entry.path().display(), e);
                    result.failed += 1;
                    continue;
                }
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let accession = name.split('.').next().unwrap_or_default().to_string();
            let _guard = self.lock_landing(&accession).await;
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("删除过期落地文件 {}", name);
                    result.removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("无法删除落地文件 {}: {}", name, e);
                    result.failed += 1;
                }
            }
        }
        if result.removed > 0 {
            info!("落地目录清理完成: 删除 {} 个文件", result.removed);
        }
        Ok(result)
    }

    /// 清空各医院的图像缓存目录
    pub async fn clear_image_cache(&self, hospitals: &[String]) -> Result<usize> {
        let mut removed = 0;
        for hospital in hospitals {
            let dir = self.images_dir().join(hospital);
            tokio::fs::create_dir_all(&dir).await?;
            removed += clear_files(&dir).await?;
        }
        debug!("图像缓存已清空: {} 个文件", removed);
        Ok(removed)
    }
}

async fn clear_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
