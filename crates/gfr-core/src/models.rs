//! 核心数据模型定义

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 医院
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hospital {
    pub short_name: String, // 目录名，例如 RH
    #[serde(default)]
    pub name: String,
}

/// 远程应用实体 (RIS / PACS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteNode {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// 科室配置
///
/// 所有连接字段都是可选的：配置来自外部，缺项的科室在轮询时被跳过。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Department {
    pub name: String,
    #[serde(default)]
    pub hospital: Option<Hospital>,
    #[serde(default)]
    pub ris: Option<RemoteNode>,
    #[serde(default)]
    pub pacs: Option<RemoteNode>,
    /// 查询 RIS 时使用的本地 AE 标题，同时也是预约的检查站 AE
    #[serde(default)]
    pub ris_calling: Option<String>,
    /// 查询 PACS 时使用的本地 AE 标题；缺省时使用监听服务的 AE 标题
    #[serde(default)]
    pub pacs_calling: Option<String>,
    #[serde(default)]
    pub accepted_procedures: Vec<String>,
    #[serde(default = "default_true")]
    pub fetch_history: bool,
    /// 每日稀释系数，仅在设置当天有效
    #[serde(default)]
    pub thinning_factor: Option<f64>,
    #[serde(default)]
    pub thinning_factor_date: Option<NaiveDate>,
}

fn default_true() -> bool {
    true
}

/// 校验通过、可直接用于轮询的科室
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyDepartment {
    pub name: String,
    pub hospital: Hospital,
    pub ris: RemoteNode,
    pub pacs: RemoteNode,
    pub ris_calling: String,
    pub pacs_calling: Option<String>,
    pub accepted_procedures: Vec<String>,
    pub fetch_history: bool,
    /// 当天有效的稀释系数
    pub calibration: Option<f64>,
}

impl Department {
    /// 检查科室配置是否完整，返回所有缺失项
    pub fn validate(&self, today: NaiveDate) -> std::result::Result<ReadyDepartment, Vec<String>> {
        let mut problems = Vec::new();

        let hospital = match &self.hospital {
            Some(h) if !h.short_name.trim().is_empty() => Some(h.clone()),
            _ => {
                problems.push("no hospital configured".to_string());
                None
            }
        };
        if self.ris.is_none() {
            problems.push("no RIS address configured".to_string());
        }
        if self.pacs.is_none() {
            problems.push("no PACS address configured".to_string());
        }
        let calling = self
            .ris_calling
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if calling.is_none() {
            problems.push("no AE title configured for RIS".to_string());
        }

        match (hospital, &self.ris, &self.pacs, calling) {
            (Some(hospital), Some(ris), Some(pacs), Some(calling)) => Ok(ReadyDepartment {
                name: self.name.clone(),
                hospital,
                ris: ris.clone(),
                pacs: pacs.clone(),
                ris_calling: calling.to_string(),
                pacs_calling: self
                    .pacs_calling
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                accepted_procedures: self.accepted_procedures.clone(),
                fetch_history: self.fetch_history,
                calibration: self.calibration_for(today),
            }),
            _ => Err(problems),
        }
    }

    /// 当天的稀释系数；隔天后视为未设置
    pub fn calibration_for(&self, today: NaiveDate) -> Option<f64> {
        match (self.thinning_factor, self.thinning_factor_date) {
            (Some(value), Some(date)) if date == today => Some(value),
            _ => None,
        }
    }
}

impl ReadyDepartment {
    /// 检查项目是否在科室允许列表中；空列表表示不过滤
    pub fn accepts(&self, procedure: Option<&str>) -> bool {
        if self.accepted_procedures.is_empty() {
            return true;
        }
        match procedure {
            Some(p) => self
                .accepted_procedures
                .iter()
                .any(|accepted| accepted.trim() == p.trim()),
            None => false,
        }
    }
}

/// 检查存储状态，每个状态对应一个根目录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreState {
    Active,  // 待处理
    Control, // 待复核
    Deleted, // 回收站
    Cached,  // 搜索缓存
}

impl StoreState {
    pub const ALL: [StoreState; 4] = [
        StoreState::Active,
        StoreState::Control,
        StoreState::Deleted,
        StoreState::Cached,
    ];

    /// 状态根目录名
    pub fn dir_name(&self) -> &'static str {
        match self {
            StoreState::Active => "active",
            StoreState::Control => "control",
            StoreState::Deleted => "deleted",
            StoreState::Cached => "cache",
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}
