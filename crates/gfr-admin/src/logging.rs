//! 日志初始化

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" | "" => Ok(LogFormat::Full),
            "compact" => Ok(LogFormat::Compact),
            other => Err(anyhow::anyhow!("未知的日志格式: {other}")),
        }
    }
}

/// 选择过滤表达式：命令行 > RUST_LOG > 配置文件
pub fn build_filter(config: &LoggingConfig, cli_override: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_override {
        return EnvFilter::try_new(level).with_context(|| format!("无效的日志级别: {level}"));
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("无效的日志级别: {}", config.level)),
    }
}

/// 初始化全局日志；进程内只调用一次
pub fn init_logging(config: &LoggingConfig, cli_override: Option<&str>) -> Result<()> {
    let filter = build_filter(config, cli_override)?;
    let format = LogFormat::parse(&config.format)?;

    let writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("无法创建日志目录 {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("无法打开日志文件 {}", path.display()))?;
            BoxMakeWriter::new(std::io::stdout.and(Arc::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.file.is_none())
        .with_writer(writer);

    let result = match format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("无法初始化日志: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::parse("Compact").unwrap(), LogFormat::Compact);
        assert_eq!(LogFormat::parse("full").unwrap(), LogFormat::Full);
        assert!(LogFormat::parse("json").is_err());
    }

    #[test]
    fn test_cli_override_wins() {
        let config = LoggingConfig {
            level: "warn".into(),
            ..Default::default()
        };
        let filter = build_filter(&config, Some("gfr_workflow=debug")).unwrap();
        assert!(filter.to_string().contains("gfr_workflow=debug"));
        assert!(build_filter(&config, Some("gfr=notalevel")).is_err());
    }
}
