//! 按检查号加锁
//!
//! 由 `ExaminationStore` 持有，所有克隆共享同一张锁表。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 同一医院同一检查号的处理互斥
#[derive(Debug, Default, Clone)]
pub struct AccessionLocks {
    inner: Arc<Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>>,
}

impl AccessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取锁，持有守卫期间其他任务不能处理同一检查
    pub async fn lock(&self, hospital: &str, accession_number: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // 清理无人持有的条目
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.entry((hospital.to_string(), accession_number.to_string()))
                .or_default()
                .clone()
        };
        slot.lock_owned().await
    }

    /// 当前登记的锁数量
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_accession_is_exclusive() {
        let locks = AccessionLocks::new();
        let guard = locks.lock("RH", "REGH001").await;

        let other = locks.clone();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            other.lock("RH", "REGH001"),
        )
        .await;
        assert!(blocked.is_err());

        // 不同检查号互不影响
        let _free = locks.lock("RH", "REGH002").await;
        drop(guard);
        let _again = locks.lock("RH", "REGH001").await;
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let locks = AccessionLocks::new();
        for i in 0..10 {
            let _guard = locks.lock("RH", &format!("REGH{i:03}")).await;
        }
        let _last = locks.lock("RH", "REGH999").await;
        assert_eq!(locks.len(), 1);
    }
}
