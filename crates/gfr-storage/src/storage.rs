//! 检查存储管理
//!
//! 目录结构: `<root>/<状态>/<医院>/<检查号>/<检查号>.dcm`，同目录下可以有其他检查号的
//! 历史文件和一个零长度的 `recovered` 标记。入站对象先落在 `<root>/landing/`。

use chrono::{DateTime, NaiveDate, Utc};
use crate::locks::AccessionLocks;
use gfr_core::utils::validate_accession_number;
use gfr_core::{Result, StoreState, SyncError};
use gfr_dicom::record::{read_record_file, write_record_file};
use gfr_dicom::ExamRecord;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// 恢复标记文件名
pub const RECOVERED_MARKER: &str = "recovered";
/// 入站落地目录名
pub const LANDING_DIR: &str = "landing";
/// 落地文件锁的命名空间；含路径分隔符，不会与医院简称重名
const LANDING_LOCKS: &str = "/landing";

/// 列举得到的一个检查
#[derive(Debug, Clone)]
pub struct StoredExamination {
    pub accession_number: String,
    pub dir: PathBuf,
    pub record: ExamRecord,
}

/// 检查存储
///
/// 克隆出的实例共享同一组检查号锁，轮询和入站服务各持一个克隆。
#[derive(Debug, Clone)]
pub struct ExaminationStore {
    root: PathBuf,
    landing: PathBuf,
    images: PathBuf,
    locks: AccessionLocks,
}

impl ExaminationStore {
    pub fn new(root: impl Into<PathBuf>, images: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            landing: root.join(LANDING_DIR),
            root,
            images: images.into(),
            locks: AccessionLocks::new(),
        }
    }

    /// 锁定一个检查目录，用于建档并获取历史检查的整个过程
    pub async fn lock_entry(&self, hospital: &str, accession_number: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(hospital, accession_number).await
    }

    /// 锁定一个落地文件；入站写入、历史检查移入和落地清理互斥
    pub async fn lock_landing(&self, accession_number: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(LANDING_LOCKS, accession_number).await
    }

    /// 创建所有基础目录；失败时进程不应继续运行
    pub async fn init(&self) -> Result<()> {
        let mut dirs: Vec<PathBuf> = StoreState::ALL
            .iter()
            .map(|state| self.root.join(state.dir_name()))
            .collect();
        dirs.push(self.landing.clone());
        dirs.push(self.images.clone());

        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SyncError::BaseDirectory(format!("{}: {e}", dir.display())))?;
        }
        info!("检查存储已初始化: {}", self.root.display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn landing_dir(&self) -> &Path {
        &self.landing
    }

    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    /// 入站对象的落地路径
    pub fn landing_path(&self, accession_number: &str) -> PathBuf {
        self.landing.join(format!("{accession_number}.dcm"))
    }

    pub fn hospital_dir(&self, state: StoreState, hospital: &str) -> PathBuf {
        self.root.join(state.dir_name()).join(hospital)
    }

    pub fn entry_dir(&self, state: StoreState, hospital: &str, accession_number: &str) -> PathBuf {
        self.hospital_dir(state, hospital).join(accession_number)
    }

    pub fn primary_path(&self, state: StoreState, hospital: &str, accession_number: &str) -> PathBuf {
        self.entry_dir(state, hospital, accession_number)
            .join(format!("{accession_number}.dcm"))
    }

    /// 检查号当前所在的状态
    pub async fn locate(&self, hospital: &str, accession_number: &str) -> Result<Option<StoreState>> {
        check_names(hospital, accession_number)?;
        for state in StoreState::ALL {
            if is_dir(&self.entry_dir(state, hospital, accession_number)).await {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// 写入主记录。已存在于其他状态时报冲突；已存在于同一状态时，除非要求覆盖，报已存在
    pub async fn put(
        &self,
        state: StoreState,
        hospital: &str,
        accession_number: &str,
        record: &ExamRecord,
        overwrite: bool,
    ) -> Result<PathBuf> {
        check_names(hospital, accession_number)?;
        match self.locate(hospital, accession_number).await? {
            Some(existing) if existing != state => {
                return Err(SyncError::Conflict(format!(
                    "{accession_number} 已位于 {existing}"
                )));
            }
            Some(_) if !overwrite => {
                return Err(SyncError::AlreadyExists(format!(
                    "{accession_number} 已位于 {state}"
                )));
            }
            _ => {}
        }

        let dir = self.entry_dir(state, hospital, accession_number);
        let created = !is_dir(&dir).await;
        let target = self.primary_path(state, hospital, accession_number);
        let partial = dir.join(format!("{accession_number}.dcm.partial"));

        let outcome = async {
            tokio::fs::create_dir_all(&dir).await?;
            let write_path = partial.clone();
            let record = record.clone();
            tokio::task::spawn_blocking(move || write_record_file(&write_path, &record))
                .await
                .map_err(|e| SyncError::Internal(format!("写入任务失败: {e}")))??;
            tokio::fs::rename(&partial, &target).await?;
            Ok::<(), SyncError>(())
        }
        .await;

        if let Err(e) = outcome {
            // 回滚本次创建的目录
            if created {
                let _ = tokio::fs::remove_dir_all(&dir).await;
            } else {
                let _ = tokio::fs::remove_file(&partial).await;
            }
            return Err(SyncError::Storage(format!(
                "无法写入 {}: {e}",
                target.display()
            )));
        }

        debug!(accession = %accession_number, "写入 {}: {}", state, target.display());
        Ok(target)
    }

    /// 在状态之间移动检查目录
    pub async fn transition(
        &self,
        hospital: &str,
        accession_number: &str,
        from: StoreState,
        to: StoreState,
    ) -> Result<()> {
        check_names(hospital, accession_number)?;
        let source = self.entry_dir(from, hospital, accession_number);
        if !is_dir(&source).await {
            return Err(SyncError::NotFound(format!(
                "{accession_number} 不在 {from}"
            )));
        }
        for state in StoreState::ALL {
            if state != from && is_dir(&self.entry_dir(state, hospital, accession_number)).await {
                return Err(SyncError::Conflict(format!(
                    "{accession_number} 已位于 {state}"
                )));
            }
        }

        let target = self.entry_dir(to, hospital, accession_number);
        tokio::fs::create_dir_all(self.hospital_dir(to, hospital)).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SyncError::Storage(format!("无法移动 {accession_number}: {e}")))?;
        info!(accession = %accession_number, "检查 {} -> {}", from, to);
        Ok(())
    }

    /// 读取主记录
    pub async fn get(
        &self,
        state: StoreState,
        hospital: &str,
        accession_number: &str,
    ) -> Result<ExamRecord> {
        check_names(hospital, accession_number)?;
        let path = self.primary_path(state, hospital, accession_number);
        if !tokio::fs::try_exists(&path).await? {
            return Err(SyncError::NotFound(format!(
                "{accession_number} 不在 {state}"
            )));
        }
        read_record(path).await
    }

    /// 列举某医院某状态下的所有检查
    pub async fn list_all(&self, state: StoreState, hospital: &str) -> Result<Listing> {
        check_hospital(hospital)?;
        let mut listing = Listing {
            dir: self.hospital_dir(state, hospital),
            names: Vec::new(),
            position: 0,
        };
        listing.rewind().await?;
        Ok(listing)
    }

    /// 某状态下已有目录的医院
    pub async fn hospitals(&self, state: StoreState) -> Result<Vec<String>> {
        subdirectories(&self.root.join(state.dir_name())).await
    }

    /// 将落地目录中的历史检查移入主检查的目录
    pub async fn adopt_historic(
        &self,
        hospital: &str,
        primary: &str,
        historic: &str,
    ) -> Result<PathBuf> {
        check_names(hospital, primary)?;
        validate_accession_number(historic)?;

        let _landing = self.lock_landing(historic).await;
        let source = self.landing_path(historic);
        if !tokio::fs::try_exists(&source).await? {
            return Err(SyncError::NotFound(format!("落地目录中没有 {historic}")));
        }
        let dir = self.entry_dir(StoreState::Active, hospital, primary);
        if !is_dir(&dir).await {
            return Err(SyncError::NotFound(format!("{primary} 不在 active")));
        }
        let target = dir.join(format!("{historic}.dcm"));
        if tokio::fs::try_exists(&target).await? {
            return Err(SyncError::AlreadyExists(format!(
                "{primary} 已有历史检查 {historic}"
            )));
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SyncError::Storage(format!("无法移动历史检查 {historic}: {e}")))?;
        debug!(accession = %primary, "加入历史检查 {}", historic);
        Ok(target)
    }

    /// 写恢复标记；日期记录在文件的修改时间上
    pub async fn mark_recovered(
        &self,
        state: StoreState,
        hospital: &str,
        accession_number: &str,
        date: NaiveDate,
    ) -> Result<()> {
        check_names(hospital, accession_number)?;
        let dir = self.entry_dir(state, hospital, accession_number);
        if !is_dir(&dir).await {
            return Err(SyncError::NotFound(format!(
                "{accession_number} 不在 {state}"
            )));
        }
        let marker = dir.join(RECOVERED_MARKER);
        let modified = date_to_system_time(date);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::create(&marker)?;
            file.set_modified(modified)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("写入任务失败: {e}")))??;
        Ok(())
    }

    /// 读取恢复日期
    pub async fn recovered_on(
        &self,
        state: StoreState,
        hospital: &str,
        accession_number: &str,
    ) -> Result<Option<NaiveDate>> {
        check_names(hospital, accession_number)?;
        let marker = self
            .entry_dir(state, hospital, accession_number)
            .join(RECOVERED_MARKER);
        marker_date(&marker).await
    }

    /// 删除检查目录
    pub async fn remove(&self, state: StoreState, hospital: &str, accession_number: &str) -> Result<()> {
        check_names(hospital, accession_number)?;
        let dir = self.entry_dir(state, hospital, accession_number);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SyncError::Storage(format!("无法删除 {}: {e}", dir.display())))
    }
}

/// 可重新开始的检查列举；缺少主文件的目录在经过时被删除
#[derive(Debug)]
pub struct Listing {
    dir: PathBuf,
    names: Vec<String>,
    position: usize,
}

impl Listing {
    /// 下一个检查；解析失败的记录作为错误返回，不影响后续条目
    pub async fn next(&mut self) -> Option<Result<StoredExamination>> {
        while self.position < self.names.len() {
            let name = self.names[self.position].clone();
            self.position += 1;

            let dir = self.dir.join(&name);
            if !is_dir(&dir).await {
                continue;
            }
            let primary = dir.join(format!("{name}.dcm"));
            match tokio::fs::try_exists(&primary).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(accession = %name, "目录缺少主文件，已清除: {}", dir.display());
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        warn!("无法清除 {}: {}", dir.display(), e);
                    }
                    continue;
                }
                Err(e) => return Some(Err(e.into())),
            }

            return Some(read_record(primary).await.map(|record| StoredExamination {
                accession_number: name,
                dir,
                record,
            }));
        }
        None
    }

    /// 重新扫描目录，从头开始
    pub async fn rewind(&mut self) -> Result<()> {
        self.names = subdirectories(&self.dir).await?;
        self.position = 0;
        Ok(())
    }
}

async fn read_record(path: PathBuf) -> Result<ExamRecord> {
    tokio::task::spawn_blocking(move || read_record_file(&path))
        .await
        .map_err(|e| SyncError::Internal(format!("读取任务失败: {e}")))?
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// 目录下的子目录名，按名称排序；目录不存在时为空
async fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub(crate) async fn marker_date(marker: &Path) -> Result<Option<NaiveDate>> {
    match tokio::fs::metadata(marker).await {
        Ok(metadata) => {
            let modified: DateTime<Utc> = metadata.modified()?.into();
            Ok(Some(modified.date_naive()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 取当天中午 (UTC)，避免时区换算跨日
fn date_to_system_time(date: NaiveDate) -> SystemTime {
    let seconds = date
        .and_hms_opt(12, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default();
    UNIX_EPOCH + Duration::from_secs(seconds.max(0) as u64)
}

fn check_hospital(hospital: &str) -> Result<()> {
    validate_accession_number(hospital)
        .map_err(|_| SyncError::Validation(format!("医院简称不能用作目录名: {hospital:?}")))
}

fn check_names(hospital: &str, accession_number: &str) -> Result<()> {
    check_hospital(hospital)?;
    validate_accession_number(accession_number)
}
