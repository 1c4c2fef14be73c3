//! 配置管理
//!
//! 配置来源依次为：内置默认值、TOML 配置文件、`GFR_` 前缀的环境变量
//! (嵌套字段用 `__` 分隔，例如 `GFR_POLLER__DELAY_MIN_SECS=60`)。

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::{Config, Environment, File};
use gfr_core::utils::is_valid_ae_title;
use gfr_core::{Department, SyncError};
use gfr_dicom::{AssociationTimeouts, ListenerConfig};
use gfr_workflow::{DepartmentDirectory, PollerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// 同步服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 入站监听配置
    pub listener: ListenerSettings,
    /// 存储配置
    pub storage: StorageSettings,
    /// 数据库配置
    pub database: DatabaseSettings,
    /// 轮询配置
    pub poller: PollerConfig,
    /// 保留期配置
    pub retention: RetentionConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 科室列表文件
    pub departments_file: Option<PathBuf>,
}

/// 入站监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    pub max_associations: usize,
    pub max_pdu_length: u32,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// 根目录，包含 active/ control/ deleted/ cache/ landing/
    pub root: PathBuf,
    /// 图像缓存目录
    pub images: PathBuf,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

/// 轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    pub fetch_history: bool,
    pub connect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub materialize_timeout_secs: u64,
}

/// 保留期配置，台账清理与缓存清理共用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤表达式
    pub level: String,
    /// full 或 compact
    pub format: String,
    /// 日志文件路径 (追加写入)
    pub file: Option<PathBuf>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        let defaults = ListenerConfig::default();
        Self {
            ae_title: defaults.ae_title,
            host: defaults.host,
            port: defaults.port,
            max_associations: defaults.max_associations,
            max_pdu_length: defaults.max_pdu_length,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            images: PathBuf::from("./data/images"),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/gfr.sqlite3".to_string(),
            max_connections: 4,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            delay_min_secs: 120,
            delay_max_secs: 180,
            fetch_history: true,
            connect_attempts: 3,
            connect_timeout_secs: 10,
            response_timeout_secs: 30,
            materialize_timeout_secs: 30,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: 14 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            file: None,
        }
    }
}

impl SyncConfig {
    /// 加载配置；未指定文件时只使用默认值和环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&SyncConfig::default()).context("无法生成默认配置")?,
        );
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("GFR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("无法读取配置")?;

        let config: SyncConfig = settings
            .try_deserialize()
            .context("配置格式错误")?;

        match path {
            Some(path) => info!("配置已加载: {}", path.display()),
            None => info!("未指定配置文件，使用默认配置"),
        }
        Ok(config)
    }

    /// 以 TOML 输出
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("无法序列化配置")
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            ae_title: self.listener.ae_title.clone(),
            host: self.listener.host.clone(),
            port: self.listener.port,
            max_associations: self.listener.max_associations,
            max_pdu_length: self.listener.max_pdu_length,
        }
    }

    pub fn association_timeouts(&self) -> AssociationTimeouts {
        AssociationTimeouts {
            connect: Duration::from_secs(self.poller.connect_timeout_secs),
            response: Duration::from_secs(self.poller.response_timeout_secs),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            listener_ae_title: self.listener.ae_title.clone(),
            delay_min: Duration::from_secs(self.poller.delay_min_secs),
            delay_max: Duration::from_secs(self.poller.delay_max_secs),
            fetch_history: self.poller.fetch_history,
            connect_attempts: self.poller.connect_attempts,
            retention_days: i64::from(self.retention.days),
            materialize_timeout: Duration::from_secs(self.poller.materialize_timeout_secs),
            ..PollerSettings::default()
        }
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数，返回问题描述
    validator: fn(&SyncConfig) -> std::result::Result<(), String>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "listener.port",
                validator: |config| match config.listener.port {
                    0 => Err("监听端口不能为 0".into()),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "listener.ae_title",
                validator: |config| {
                    if is_valid_ae_title(&config.listener.ae_title) {
                        Ok(())
                    } else {
                        Err(format!("无效的 AE 标题: {:?}", config.listener.ae_title))
                    }
                },
            },
            ValidationRule {
                field_path: "listener.max_associations",
                validator: |config| match config.listener.max_associations {
                    0 => Err("最大关联数不能为 0".into()),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "poller.delay_min_secs",
                validator: |config| {
                    if config.poller.delay_min_secs > config.poller.delay_max_secs {
                        Err(format!(
                            "最小等待 {}s 大于最大等待 {}s",
                            config.poller.delay_min_secs, config.poller.delay_max_secs
                        ))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "poller.connect_attempts",
                validator: |config| match config.poller.connect_attempts {
                    0 => Err("连接尝试次数不能为 0".into()),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "retention.days",
                validator: |config| match config.retention.days {
                    0 => Err("保留天数不能为 0".into()),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| match config.database.max_connections {
                    0 => Err("数据库最大连接数不能为 0".into()),
                    _ => Ok(()),
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置，返回第一个问题
    pub fn validate(&self, config: &SyncConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(problem) = (rule.validator)(config) {
                error!("配置验证失败 {}: {}", rule.field_path, problem);
                return Err(anyhow::anyhow!("{}: {}", rule.field_path, problem));
            }
        }
        info!("配置验证通过");
        Ok(())
    }
}

/// 科室列表文件
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DepartmentsFile {
    #[serde(default)]
    departments: Vec<Department>,
}

/// 从 TOML 文件读取科室；每次调用都重新读取
#[derive(Debug, Clone)]
pub struct FileDepartments {
    path: PathBuf,
}

impl FileDepartments {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DepartmentDirectory for FileDepartments {
    async fn departments(&self) -> gfr_core::Result<Vec<Department>> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::Config(format!("无法读取科室文件 {}: {e}", self.path.display()))
        })?;
        let file: DepartmentsFile = toml::from_str(&text).map_err(|e| {
            SyncError::Config(format!("科室文件格式错误 {}: {e}", self.path.display()))
        })?;
        Ok(file.departments)
    }
}
