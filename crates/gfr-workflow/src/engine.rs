//! 轮询引擎
//!
//! 每次轮询依次处理所有科室：建立三条关联 (RIS 查询、PACS 查询、PACS 迁移)，查询 RIS
//! 预约，对新检查去重后写入 Active 并获取历史检查，最后释放关联。每天第一次轮询时
//! 执行清理。

use crate::departments::DepartmentDirectory;
use crate::history::HistoryFetcher;
use chrono::{Local, NaiveDate, Utc};
use gfr_core::{ConnectionError, ReadyDepartment, RemoteNode, Result, StoreState};
use gfr_database::{HandledLedger, TickJournal};
use gfr_dicom::record::ris_worklist_query;
use gfr_dicom::{Connector, DecodeMode, DimseSession, DimseStatus, ExamRecord, ServiceContext};
use gfr_storage::ExaminationStore;
use rand::Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 落地目录中未被移入的文件保留一天
const LANDING_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// 轮询流程所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    Idle,
    Associating,
    Querying,
    Processing,
    Releasing,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollerState::Idle => "idle",
            PollerState::Associating => "associating",
            PollerState::Querying => "querying",
            PollerState::Processing => "processing",
            PollerState::Releasing => "releasing",
        };
        f.write_str(name)
    }
}

/// 轮询参数
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// 监听端 AE 标题；迁移目的地，也是缺省的 PACS 调用方
    pub listener_ae_title: String,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub fetch_history: bool,
    pub connect_attempts: u32,
    pub retry_backoff: Duration,
    pub retention_days: i64,
    pub materialize_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            listener_ae_title: "GFRCALC".to_string(),
            delay_min: Duration::from_secs(120),
            delay_max: Duration::from_secs(180),
            fetch_history: true,
            connect_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            retention_days: 14,
            materialize_timeout: Duration::from_secs(30),
        }
    }
}

/// 单个预约的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingOutcome {
    Created,
    /// 缺少检查号或患者号
    Discarded,
    /// 不在科室允许的检查项目中
    Filtered,
    /// 已处理或已存在
    Skipped,
    Failed,
}

/// 一次轮询的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub departments_polled: usize,
    pub departments_skipped: usize,
    pub created: usize,
    pub discarded: usize,
    pub filtered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub maintenance_ran: bool,
}

impl TickReport {
    fn count(&mut self, outcome: BookingOutcome) {
        match outcome {
            BookingOutcome::Created => self.created += 1,
            BookingOutcome::Discarded => self.discarded += 1,
            BookingOutcome::Filtered => self.filtered += 1,
            BookingOutcome::Skipped => self.skipped += 1,
            BookingOutcome::Failed => self.failed += 1,
        }
    }
}

/// 一个科室的三条关联
struct Sessions {
    ris: Box<dyn DimseSession>,
    pacs_query: Box<dyn DimseSession>,
    pacs_relocate: Box<dyn DimseSession>,
}

/// RIS 轮询器
pub struct RisPoller {
    settings: PollerSettings,
    directory: Arc<dyn DepartmentDirectory>,
    connector: Arc<dyn Connector>,
    store: ExaminationStore,
    ledger: Arc<dyn HandledLedger>,
    journal: Option<TickJournal>,
    history: HistoryFetcher,
    state: watch::Sender<PollerState>,
    last_maintenance: Option<NaiveDate>,
}

impl RisPoller {
    pub fn new(
        settings: PollerSettings,
        directory: Arc<dyn DepartmentDirectory>,
        connector: Arc<dyn Connector>,
        store: ExaminationStore,
        ledger: Arc<dyn HandledLedger>,
    ) -> Self {
        let history = HistoryFetcher::new(
            store.clone(),
            settings.listener_ae_title.clone(),
            settings.materialize_timeout,
        );
        let (state, _) = watch::channel(PollerState::Idle);
        Self {
            settings,
            directory,
            connector,
            store,
            ledger,
            journal: None,
            history,
            state,
            // 启动当天不清理，日期变化后的第一次轮询才清理
            last_maintenance: Some(Local::now().date_naive()),
        }
    }

    /// 记录每个科室的轮询结果
    pub fn with_journal(mut self, journal: TickJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// 下一次轮询前的随机等待时间
    pub fn next_delay(&self) -> Duration {
        let min = self.settings.delay_min;
        let max = self.settings.delay_max.max(min);
        if min == max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// 执行一次轮询；所有错误都在内部记录，不会中断进程
    pub async fn tick(&mut self, today: NaiveDate) -> TickReport {
        let mut report = TickReport::default();

        let departments = match self.directory.departments().await {
            Ok(departments) => departments,
            Err(e) => {
                error!("无法读取科室配置: {}", e);
                return report;
            }
        };

        if self.last_maintenance != Some(today) {
            let hospitals: BTreeSet<String> = departments
                .iter()
                .filter_map(|d| d.hospital.as_ref())
                .map(|h| h.short_name.clone())
                .collect();
            self.daily_maintenance(today, &hospitals.into_iter().collect::<Vec<_>>())
                .await;
            self.last_maintenance = Some(today);
            report.maintenance_ran = true;
        }

        for department in departments {
            let ready = match department.validate(today) {
                Ok(ready) => ready,
                Err(problems) => {
                    warn!(
                        department = %department.name,
                        "科室配置不完整，已跳过: {}",
                        problems.join("; ")
                    );
                    self.record_outcome(&department.name, Err(problems.join("; ")))
                        .await;
                    report.departments_skipped += 1;
                    continue;
                }
            };

            match self.poll_department(&ready, &mut report).await {
                Ok(()) => {
                    report.departments_polled += 1;
                    self.record_outcome(&ready.name, Ok(())).await;
                }
                Err(e) => {
                    warn!(department = %ready.name, "本次轮询跳过科室: {}", e);
                    report.departments_skipped += 1;
                    self.record_outcome(&ready.name, Err(e.to_string())).await;
                }
            }
        }

        self.set_state(PollerState::Idle);
        debug!("轮询完成: {:?}", report);
        report
    }

    async fn poll_department(
        &self,
        department: &ReadyDepartment,
        report: &mut TickReport,
    ) -> Result<()> {
        if let Some(calibration) = department.calibration {
            debug!(department = %department.name, "今日稀释系数: {}", calibration);
        }
        self.set_state(PollerState::Associating);
        let mut sessions = self.open_sessions(department).await?;

        let outcome = self.query_bookings(department, &mut sessions, report).await;

        // 无论查询结果如何都释放所有关联
        self.set_state(PollerState::Releasing);
        release_all(sessions, &department.name).await;
        outcome
    }

    /// 三条关联必须全部建立，否则释放已建立的并跳过科室
    async fn open_sessions(&self, department: &ReadyDepartment) -> Result<Sessions> {
        let pacs_calling = department
            .pacs_calling
            .as_deref()
            .unwrap_or(&self.settings.listener_ae_title);

        let ris = self
            .connect(&department.ris_calling, &department.ris, ServiceContext::Query)
            .await?;

        let pacs_query = match self
            .connect(pacs_calling, &department.pacs, ServiceContext::Query)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                release_one(ris, &department.name).await;
                return Err(e.into());
            }
        };

        let pacs_relocate = match self
            .connect(pacs_calling, &department.pacs, ServiceContext::Relocate)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                release_one(ris, &department.name).await;
                release_one(pacs_query, &department.name).await;
                return Err(e.into());
            }
        };

        Ok(Sessions {
            ris,
            pacs_query,
            pacs_relocate,
        })
    }

    /// 有限次重试建立关联
    async fn connect(
        &self,
        local_ae: &str,
        node: &RemoteNode,
        context: ServiceContext,
    ) -> std::result::Result<Box<dyn DimseSession>, ConnectionError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect(local_ae, node, context.clone()).await {
                Ok(session) => return Ok(session),
                // 参数错误和上下文被拒绝不会因重试而改变
                Err(e @ ConnectionError::InvalidParameters(_))
                | Err(e @ ConnectionError::ContextRejected(_)) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("连接 {} 失败 (第 {} 次): {}", node, attempt, e);
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
            }
        }
    }

    async fn query_bookings(
        &self,
        department: &ReadyDepartment,
        sessions: &mut Sessions,
        report: &mut TickReport,
    ) -> Result<()> {
        self.set_state(PollerState::Querying);
        sessions
            .ris
            .begin_find(&ris_worklist_query(&department.ris_calling))
            .await?;

        // 先取完 RIS 的全部响应，再逐个处理
        let mut bookings = Vec::new();
        while let Some(response) = sessions.ris.next_response().await {
            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_decode() => {
                    warn!(department = %department.name, "丢弃无法解码的预约: {}", e);
                    report.count(BookingOutcome::Discarded);
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
                Ok(record) => bookings.push(record),
                Err(e) => {
                    warn!(department = %department.name, "丢弃无法解析的预约: {}", e);
                    report.count(BookingOutcome::Discarded);
                }
            }
        }
        info!(department = %department.name, "RIS 返回 {} 个预约", bookings.len());

        self.set_state(PollerState::Processing);
        for record in bookings {
            let outcome = self.handle_booking(department, sessions, record).await;
            report.count(outcome);
        }
        Ok(())
    }

    async fn handle_booking(
        &self,
        department: &ReadyDepartment,
        sessions: &mut Sessions,
        record: ExamRecord,
    ) -> BookingOutcome {
        let accession = match record.identity() {
            Ok((accession, _)) => accession.to_string(),
            Err(_) => {
                debug!(department = %department.name, "丢弃缺少检查号或患者号的预约");
                return BookingOutcome::Discarded;
            }
        };
        if !department.accepts(record.procedure()) {
            debug!(
                accession = %accession,
                "检查项目 {:?} 不在允许列表中",
                record.procedure()
            );
            return BookingOutcome::Filtered;
        }

        let hospital = department.hospital.short_name.as_str();
        let _guard = self.store.lock_entry(hospital, &accession).await;

        match self.is_known(hospital, &accession).await {
            Ok(true) => return BookingOutcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                error!(accession = %accession, "去重检查失败: {}", e);
                return BookingOutcome::Failed;
            }
        }

        match self
            .store
            .put(StoreState::Active, hospital, &accession, &record, false)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_duplicate() => return BookingOutcome::Skipped,
            Err(e) => {
                error!(accession = %accession, "无法保存新检查: {}", e);
                return BookingOutcome::Failed;
            }
        }
        info!(department = %department.name, accession = %accession, "新检查已保存");

        if self.settings.fetch_history && department.fetch_history {
            if let Err(e) = self
                .history
                .fetch(
                    sessions.pacs_query.as_mut(),
                    sessions.pacs_relocate.as_mut(),
                    hospital,
                    &record,
                )
                .await
            {
                warn!(accession = %accession, "历史检查获取失败: {}", e);
            }
        }
        BookingOutcome::Created
    }

    /// 台账中已处理，或已存在于任一状态目录
    async fn is_known(&self, hospital: &str, accession: &str) -> Result<bool> {
        if self.ledger.is_handled(accession).await? {
            debug!(accession = %accession, "已处理，跳过");
            return Ok(true);
        }
        if let Some(state) = self.store.locate(hospital, accession).await? {
            debug!(accession = %accession, "已位于 {}，跳过", state);
            return Ok(true);
        }
        Ok(false)
    }

    /// 每日清理：台账过期条目、图像缓存、搜索缓存、落地目录
    async fn daily_maintenance(&self, today: NaiveDate, hospitals: &[String]) {
        info!("执行每日清理 ({})", today);
        let days = self.settings.retention_days;
        if let Err(e) = self.ledger.sweep_older_than(today, days).await {
            error!("台账清理失败: {}", e);
        }
        if let Err(e) = self.store.clear_image_cache(hospitals).await {
            error!("图像缓存清理失败: {}", e);
        }
        match self.store.evict_cache(today, days).await {
            Ok(eviction) if eviction.failed > 0 => {
                warn!("搜索缓存有 {} 个检查未能清理", eviction.failed);
            }
            Ok(_) => {}
            Err(e) => error!("搜索缓存清理失败: {}", e),
        }
        match self.store.sweep_landing(SystemTime::now(), LANDING_MAX_AGE).await {
            Ok(sweep) if sweep.failed > 0 => {
                warn!("落地目录有 {} 个文件未能清理", sweep.failed);
            }
            Ok(_) => {}
            Err(e) => error!("落地目录清理失败: {}", e),
        }
    }

    async fn record_outcome(&self, department: &str, outcome: std::result::Result<(), String>) {
        let Some(journal) = &self.journal else {
            return;
        };
        let now = Utc::now();
        let result = match outcome {
            Ok(()) => journal.record_success(department, now).await,
            Err(reason) => journal.record_failure(department, now, &reason).await,
        };
        if let Err(e) = result {
            error!(department = %department, "无法记录轮询结果: {}", e);
        }
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_replace(state);
    }
}

async fn release_all(sessions: Sessions, department: &str) {
    release_one(sessions.ris, department).await;
    release_one(sessions.pacs_query, department).await;
    release_one(sessions.pacs_relocate, department).await;
}

async fn release_one(session: Box<dyn DimseSession>, department: &str) {
    if let Err(e) = session.release().await {
        warn!(department = %department, "释放关联失败: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::departments::StaticDepartments;
    use crate::testing::{booking, department, historic, FakeConnector, Script, PACS_AE, RIS_AE};
    use chrono::Duration as Days;
    use gfr_core::Department;
    use gfr_database::{DatabasePool, SqlLedger};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ExaminationStore,
        ledger: SqlLedger,
        journal: TickJournal,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ExaminationStore::new(dir.path().join("data"), dir.path().join("images"));
        store.init().await.unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.sqlite3").display());
        let db = DatabasePool::connect(&url, 2).await.unwrap();
        Fixture {
            _dir: dir,
            store,
            ledger: SqlLedger::new(db.clone()),
            journal: TickJournal::new(db),
        }
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            delay_min: Duration::from_millis(10),
            delay_max: Duration::from_millis(20),
            retry_backoff: Duration::ZERO,
            materialize_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn poller(fx: &Fixture, connector: &FakeConnector, departments: Vec<Department>) -> RisPoller {
        RisPoller::new(
            settings(),
            Arc::new(StaticDepartments::new(departments)),
            Arc::new(connector.clone()),
            fx.store.clone(),
            Arc::new(fx.ledger.clone()),
        )
        .with_journal(fx.journal.clone())
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    #[tokio::test]
    async fn test_allow_list_admits_only_accepted_procedure() {
        let fx = fixture().await;
        let mut script = Script::default();
        script.records.insert(
            RIS_AE.into(),
            vec![
                booking("REGH001", "0101011234", "GFR, Tc-99m-DTPA"),
                booking("REGH002", "0202021234", "Ultrasound"),
            ],
        );
        let connector = FakeConnector::new(script);
        let mut poller = poller(&fx, &connector, vec![department("GFR", &["GFR, Tc-99m-DTPA"])]);

        let report = poller.tick(today()).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(
            fx.store.locate("RH", "REGH001").await.unwrap(),
            Some(StoreState::Active)
        );
        assert_eq!(fx.store.locate("RH", "REGH002").await.unwrap(), None);

        // 每条关联都已释放
        assert_eq!(connector.log.count("connect"), 3);
        assert_eq!(connector.log.count("release"), 3);
        assert_eq!(poller.state(), PollerState::Idle);

        let tick = fx.journal.get("GFR").await.unwrap().unwrap();
        assert!(tick.last_success.is_some());
    }

    #[tokio::test]
    async fn test_handled_accession_is_not_refetched() {
        let fx = fixture().await;
        fx.ledger
            .mark_handled("REGH001", today() - Days::days(1))
            .await
            .unwrap();
        let mut script = Script::default();
        script.records.insert(
            RIS_AE.into(),
            vec![booking("REGH001", "0101011234", "GFR, Tc-99m-DTPA")],
        );
        let connector = FakeConnector::new(script);
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        let report = poller.tick(today()).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.created, 0);
        assert_eq!(fx.store.locate("RH", "REGH001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_tick_is_idempotent() {
        let fx = fixture().await;
        let mut script = Script::default();
        script.landing = Some(fx.store.landing_dir().to_path_buf());
        script.records.insert(
            RIS_AE.into(),
            vec![booking("REGH010", "0101011234", "GFR, Tc-99m-DTPA")],
        );
        script.records.insert(
            PACS_AE.into(),
            vec![historic("REGH001", "0101011234", "1.2.3.1")],
        );
        let connector = FakeConnector::new(script);
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        let first = poller.tick(today()).await;
        assert_eq!(first.created, 1);
        assert!(first.maintenance_ran);
        let dir = fx.store.entry_dir(StoreState::Active, "RH", "REGH010");
        assert!(dir.join("REGH001.dcm").exists());
        assert_eq!(connector.log.count("find PACS"), 1);

        let second = poller.tick(today()).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);
        assert!(!second.maintenance_ran);
        assert_eq!(connector.log.count("find PACS"), 1);
        assert_eq!(connector.log.count("relocate"), 1);

        // 已移到 Deleted 的检查也不会重新出现在 Active
        fx.store
            .transition("RH", "REGH010", StoreState::Active, StoreState::Deleted)
            .await
            .unwrap();
        poller.tick(today()).await;
        assert_eq!(
            fx.store.locate("RH", "REGH010").await.unwrap(),
            Some(StoreState::Deleted)
        );
    }

    #[tokio::test]
    async fn test_failed_association_releases_established_ones() {
        let fx = fixture().await;
        let mut script = Script::default();
        script.refuse(PACS_AE, &ServiceContext::Relocate);
        script.records.insert(
            RIS_AE.into(),
            vec![booking("REGH001", "0101011234", "GFR, Tc-99m-DTPA")],
        );
        let connector = FakeConnector::new(script);
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        let report = poller.tick(today()).await;
        assert_eq!(report.departments_skipped, 1);
        assert_eq!(report.created, 0);
        assert_eq!(connector.log.count("find"), 0);
        // 两条已建立的关联被释放；拒绝的那条重试了 3 次
        assert_eq!(connector.log.count("release"), 2);
        assert_eq!(connector.log.count("connect PACS Relocate"), 3);

        let tick = fx.journal.get("GFR").await.unwrap().unwrap();
        assert!(tick.is_degraded());
    }

    #[tokio::test]
    async fn test_incomplete_department_and_bad_bookings() {
        let fx = fixture().await;
        let mut script = Script::default();
        let mut no_patient = booking("REGH003", "x", "GFR, Tc-99m-DTPA");
        no_patient.patient_id = None;
        script.records.insert(
            RIS_AE.into(),
            vec![no_patient, booking("REGH004", "0101011234", "GFR, Tc-99m-DTPA")],
        );
        let connector = FakeConnector::new(script);
        let broken = Department {
            name: "Broken".into(),
            ..Default::default()
        };
        let mut poller = poller(&fx, &connector, vec![broken, department("GFR", &[])]);

        let report = poller.tick(today()).await;
        assert_eq!(report.departments_skipped, 1);
        assert_eq!(report.departments_polled, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn test_undecodable_booking_does_not_stop_department() {
        let fx = fixture().await;
        let mut script = Script::default();
        script.undecodable.insert(RIS_AE.into());
        script.records.insert(
            RIS_AE.into(),
            vec![
                booking("REGH001", "0101011234", "GFR, Tc-99m-DTPA"),
                booking("REGH002", "0202021234", "GFR, Tc-99m-DTPA"),
            ],
        );
        let connector = FakeConnector::new(script);
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        let report = poller.tick(today()).await;
        assert_eq!(report.departments_polled, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.created, 2);
        for accession in ["REGH001", "REGH002"] {
            assert_eq!(
                fx.store.locate("RH", accession).await.unwrap(),
                Some(StoreState::Active)
            );
        }
        let tick = fx.journal.get("GFR").await.unwrap().unwrap();
        assert!(!tick.is_degraded());
    }

    #[tokio::test]
    async fn test_no_maintenance_on_start_day() {
        let fx = fixture().await;
        let started = Local::now().date_naive();
        fx.ledger
            .mark_handled("REGH002", started - Days::days(20))
            .await
            .unwrap();
        let connector = FakeConnector::new(Script::default());
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        let report = poller.tick(started).await;
        assert!(!report.maintenance_ran);
        assert!(fx.ledger.is_handled("REGH002").await.unwrap());

        let report = poller.tick(started + Days::days(1)).await;
        assert!(report.maintenance_ran);
        assert!(!fx.ledger.is_handled("REGH002").await.unwrap());
    }

    #[tokio::test]
    async fn test_daily_maintenance_sweeps_ledger() {
        let fx = fixture().await;
        fx.ledger
            .mark_handled("REGH002", today() - Days::days(20))
            .await
            .unwrap();
        let connector = FakeConnector::new(Script::default());
        let mut poller = poller(&fx, &connector, vec![department("GFR", &[])]);

        poller.tick(today()).await;
        assert!(!fx.ledger.is_handled("REGH002").await.unwrap());
        assert!(fx.store.images_dir().join("RH").exists());
    }

    #[tokio::test]
    async fn test_delay_within_bounds() {
        let fx = fixture().await;
        let connector = FakeConnector::new(Script::default());
        let poller = poller(&fx, &connector, Vec::new());
        let settings = settings();
        for _ in 0..50 {
            let delay = poller.next_delay();
            assert!(delay >= settings.delay_min && delay <= settings.delay_max);
        }
    }
}
