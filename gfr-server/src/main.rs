//! GFR同步服务主程序

use anyhow::{Context, Result};
use clap::Parser;
use gfr_admin::{init_logging, ConfigValidator, FileDepartments, SyncConfig};
use gfr_database::{DatabasePool, SqlLedger, TickJournal};
use gfr_dicom::{ListenerService, NetworkConnector, StorageListener};
use gfr_storage::{ExaminationStore, LandingInbox};
use gfr_workflow::{DepartmentDirectory, PollerService, RisPoller, StaticDepartments};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// GFR同步服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "gfr-server")]
#[command(about = "RIS/PACS 检查同步服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件和 RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,

    /// 输出默认配置后退出
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", SyncConfig::default().to_toml()?);
        return Ok(());
    }

    let config = SyncConfig::load(args.config.as_deref())?;
    init_logging(&config.logging, args.log_level.as_deref())?;

    if let Err(e) = run(config).await {
        error!("服务异常退出: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: SyncConfig) -> Result<()> {
    ConfigValidator::new().validate(&config)?;
    info!("启动GFR同步服务...");

    // 基础目录和台账不可用时直接退出
    let store = ExaminationStore::new(&config.storage.root, &config.storage.images);
    store.init().await.context("无法创建存储目录")?;

    let db = DatabasePool::connect(&config.database.url, config.database.max_connections)
        .await
        .context("无法连接台账数据库")?;

    let landing = Arc::new(LandingInbox::new(store.clone()));
    let listener = StorageListener::bind(config.listener_config(), landing)
        .await
        .context("无法绑定监听端口")?;
    let listener = ListenerService::start(listener)?;
    info!(
        "入站监听: {} ({})",
        listener.local_addr(),
        config.listener.ae_title
    );

    let directory: Arc<dyn DepartmentDirectory> = match &config.departments_file {
        Some(path) => {
            info!("科室配置文件: {}", path.display());
            Arc::new(FileDepartments::new(path))
        }
        None => {
            warn!("未配置科室文件，轮询不会处理任何科室");
            Arc::new(StaticDepartments::default())
        }
    };

    let poller = RisPoller::new(
        config.poller_settings(),
        directory,
        Arc::new(NetworkConnector::new(config.association_timeouts())),
        store,
        Arc::new(SqlLedger::new(db.clone())),
    )
    .with_journal(TickJournal::new(db.clone()));
    let poller = PollerService::start(poller);

    tokio::signal::ctrl_c()
        .await
        .context("无法监听退出信号")?;
    info!("收到退出信号，正在停止...");

    poller.stop().await;
    if let Err(e) = listener.stop().await {
        warn!("监听服务停止时出错: {}", e);
    }
    db.close().await;

    info!("GFR同步服务已停止");
    Ok(())
}
