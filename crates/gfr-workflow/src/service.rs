//! 轮询服务
//!
//! 由进程入口持有，显式启动和停止。停止时立即结束轮询间的等待；正在进行的轮询会
//! 执行完毕，所有关联都被释放后才退出。

use crate::engine::{PollerState, RisPoller};
use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct PollerService {
    state: watch::Receiver<PollerState>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollerService {
    /// 在后台任务中启动轮询循环
    pub fn start(poller: RisPoller) -> Self {
        let state = poller.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(poller, shutdown.clone()));
        info!("RIS 轮询服务已启动");
        Self {
            state,
            shutdown,
            handle,
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// 状态变化通知
    pub fn watch(&self) -> watch::Receiver<PollerState> {
        self.state.clone()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!("轮询任务异常退出: {}", e);
        }
        info!("RIS 轮询服务已停止");
    }
}

async fn run(mut poller: RisPoller, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let today = Local::now().date_naive();
        let report = poller.tick(today).await;
        info!(
            "轮询完成: 新增 {}，跳过 {}，过滤 {}，失败 {}",
            report.created, report.skipped, report.filtered, report.failed
        );

        let delay = poller.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::departments::StaticDepartments;
    use crate::engine::PollerSettings;
    use crate::testing::{booking, department, FakeConnector, Script, RIS_AE};
    use gfr_database::{DatabasePool, SqlLedger};
    use gfr_storage::ExaminationStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExaminationStore::new(dir.path().join("data"), dir.path().join("images"));
        store.init().await.unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.sqlite3").display());
        let ledger = SqlLedger::new(DatabasePool::connect(&url, 1).await.unwrap());

        let mut script = Script::default();
        script.records.insert(
            RIS_AE.into(),
            vec![booking("REGH001", "0101011234", "GFR, Tc-99m-DTPA")],
        );
        let connector = FakeConnector::new(script);
        let settings = PollerSettings {
            delay_min: Duration::from_secs(3600),
            delay_max: Duration::from_secs(3600),
            fetch_history: false,
            ..Default::default()
        };
        let poller = RisPoller::new(
            settings,
            Arc::new(StaticDepartments::new(vec![department("GFR", &[])])),
            Arc::new(connector.clone()),
            store.clone(),
            Arc::new(ledger),
        );

        let service = PollerService::start(poller);
        // 等待第一次轮询完成
        let mut waited = Duration::ZERO;
        while connector.log.count("release") < 3 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert_eq!(connector.log.count("release"), 3);

        tokio::time::timeout(Duration::from_secs(2), service.stop())
            .await
            .unwrap();
        assert!(store.locate("RH", "REGH001").await.unwrap().is_some());
    }
}
