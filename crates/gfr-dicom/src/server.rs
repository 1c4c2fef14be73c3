//! 入站存储监听器

use crate::association::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use crate::dimse::{
    read_message, send_message, Command, CommandType, DimseMessage, Inbound, MessageAssembler,
};
use crate::pdu::{
    AssociateAc, AssociateRj, AssociateRq, Pdu, PduCodec, PresentationContextNegotiated,
    PresentationContextResult, UserInformation, DEFAULT_MAX_PDU_LENGTH,
};
use crate::services::InboundHandler;
use crate::status::{
    STATUS_CANNOT_UNDERSTAND, STATUS_OUT_OF_RESOURCES, STATUS_SUCCESS,
    STATUS_UNRECOGNIZED_OPERATION,
};
use crate::transfer_syntax::{sop_class_uids, TransferSyntaxManager, STORAGE_SOP_CLASSES};
use futures_util::{SinkExt, StreamExt};
use gfr_core::{Result, SyncError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 等待 A-ASSOCIATE-RQ 的时间
const ASSOCIATE_TIMEOUT: Duration = Duration::from_secs(30);
/// 停止时等待进行中关联的时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 监听器配置
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub ae_title: String,        // 应用实体标题
    pub host: String,            // 绑定地址
    pub port: u16,               // 监听端口
    pub max_associations: usize, // 最大并发关联数
    pub max_pdu_length: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ae_title: "GFRCALC".to_string(),
            host: "0.0.0.0".to_string(),
            port: 11112,
            max_associations: 16,
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
        }
    }
}

/// 入站存储监听器：接受存储与验证，拒绝迁移请求
pub struct StorageListener {
    config: Arc<ListenerConfig>,
    listener: TcpListener,
    handler: Arc<dyn InboundHandler>,
}

impl StorageListener {
    /// 绑定端口；失败属于启动错误
    pub async fn bind(config: ListenerConfig, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                SyncError::Config(format!(
                    "无法绑定 {}:{}: {e}",
                    config.host, config.port
                ))
            })?;
        info!(
            "存储监听器已绑定: AE={}, 地址={}",
            config.ae_title,
            listener.local_addr()?
        );
        Ok(Self {
            config: Arc::new(config),
            listener,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到停止信号，然后等待进行中的关联结束
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("接受连接: {}", remote_addr);
                        let busy = connections.len() >= self.config.max_associations;
                        let config = self.config.clone();
                        let handler = self.handler.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, remote_addr, config, handler, busy).await {
                                warn!("处理连接 {} 失败: {}", remote_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("连接任务异常退出: {}", e);
                    }
                }
            }
        }

        info!("存储监听器停止接受连接，等待 {} 个进行中的关联", connections.len());
        let drained = timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("等待入站关联超时，强制中止 {} 个", connections.len());
            connections.shutdown().await;
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<ListenerConfig>,
    handler: Arc<dyn InboundHandler>,
    busy: bool,
) -> Result<()> {
    let mut framed = Framed::new(stream, PduCodec::new(config.max_pdu_length));

    let request = match timeout(ASSOCIATE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Pdu::AssociateRq(request)))) => request,
        Ok(Some(Ok(other))) => {
            warn!("{} 未以 A-ASSOCIATE-RQ 开始: {}", remote_addr, other.name());
            framed.send(Pdu::Abort { source: 2, reason: 2 }).await?;
            return Ok(());
        }
        Ok(Some(Err(e))) => return Err(e),
        Ok(None) => return Ok(()),
        Err(_) => {
            warn!("{} 未在限定时间内请求关联", remote_addr);
            return Ok(());
        }
    };

    if busy {
        warn!("并发关联已满，拒绝 {} ({})", request.calling_ae_title, remote_addr);
        framed
            .send(Pdu::AssociateRj(AssociateRj {
                result: 2,
                source: 3,
                reason: 2,
            }))
            .await?;
        return Ok(());
    }

    if request.called_ae_title.trim() != config.ae_title.trim() {
        warn!(
            "{} 呼叫了未知的AE {:?} ({})",
            request.calling_ae_title, request.called_ae_title, remote_addr
        );
        framed
            .send(Pdu::AssociateRj(AssociateRj {
                result: 1,
                source: 1,
                reason: 7, // called AE title not recognized
            }))
            .await?;
        return Ok(());
    }

    let (accept, accepted) = negotiate(&config, &request);
    if accepted.is_empty() {
        info!(
            "{} 提议的表示上下文均不支持 ({})",
            request.calling_ae_title, remote_addr
        );
    }
    framed.send(Pdu::AssociateAc(accept)).await?;
    info!(
        "入站关联已建立: {} -> {} ({})",
        request.calling_ae_title, config.ae_title, remote_addr
    );

    let peer_max_pdu_length = match request.user_information.max_pdu_length {
        0 => DEFAULT_MAX_PDU_LENGTH,
        n => n,
    };
    let mut assembler = MessageAssembler::new();

    loop {
        match read_message(&mut framed, &mut assembler).await? {
            Inbound::Message(message) => {
                let context_id = message.context_id;
                let Some(transfer_syntax) = accepted.get(&context_id) else {
                    warn!("消息使用了未接受的表示上下文 {}", context_id);
                    framed.send(Pdu::Abort { source: 2, reason: 6 }).await?;
                    return Ok(());
                };
                if let Some(response) = dispatch(message, transfer_syntax, handler.as_ref()).await {
                    send_message(&mut framed, context_id, &response, None, peer_max_pdu_length)
                        .await?;
                }
            }
            Inbound::ReleaseRequested => {
                framed.send(Pdu::ReleaseRp).await?;
                debug!("入站关联已释放: {}", remote_addr);
                return Ok(());
            }
            Inbound::ReleaseConfirmed | Inbound::Aborted | Inbound::Closed => return Ok(()),
        }
    }
}

/// 为每个提议的上下文选择结果，返回 AC 和已接受上下文的传输语法
fn negotiate(config: &ListenerConfig, request: &AssociateRq) -> (AssociateAc, HashMap<u8, String>) {
    let mut accepted = HashMap::new();
    let presentation_contexts = request
        .presentation_contexts
        .iter()
        .map(|pc| {
            let abstract_syntax = pc.abstract_syntax.as_str();
            let supported = STORAGE_SOP_CLASSES.contains(&abstract_syntax)
                || abstract_syntax == sop_class_uids::STUDY_ROOT_MOVE
                || abstract_syntax == sop_class_uids::VERIFICATION;
            let selected = TransferSyntaxManager::select(&pc.transfer_syntaxes);
            match (supported, selected) {
                (true, Some(ts)) => {
                    accepted.insert(pc.id, ts.clone());
                    PresentationContextNegotiated {
                        id: pc.id,
                        result: PresentationContextResult::Acceptance,
                        transfer_syntax: ts,
                    }
                }
                (true, None) => PresentationContextNegotiated {
                    id: pc.id,
                    result: PresentationContextResult::TransferSyntaxNotSupported,
                    transfer_syntax: String::new(),
                },
                (false, _) => PresentationContextNegotiated {
                    id: pc.id,
                    result: PresentationContextResult::AbstractSyntaxNotSupported,
                    transfer_syntax: String::new(),
                },
            }
        })
        .collect();

    let accept = AssociateAc {
        called_ae_title: request.called_ae_title.clone(),
        calling_ae_title: request.calling_ae_title.clone(),
        application_context: request.application_context.clone(),
        presentation_contexts,
        user_information: UserInformation {
            max_pdu_length: config.max_pdu_length,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
        },
    };
    (accept, accepted)
}

/// 处理一个请求，返回需要发送的响应命令
async fn dispatch(
    message: DimseMessage,
    transfer_syntax: &str,
    handler: &dyn InboundHandler,
) -> Option<Command> {
    let request = &message.command;
    match request.command_type() {
        CommandType::CEcho => Some(Command::response_to(request, STATUS_SUCCESS)),
        CommandType::CStore => {
            let sop_class = request.affected_sop_class_uid.clone().unwrap_or_default();
            let sop_instance = request.affected_sop_instance_uid.clone().unwrap_or_default();
            let obj = match message
                .dataset
                .as_deref()
                .map(|data| TransferSyntaxManager::decode_dataset(data, transfer_syntax))
            {
                Some(Ok(obj)) => obj,
                Some(Err(e)) => {
                    warn!("无法解码入站数据集: {}", e);
                    return Some(
                        Command::response_to(request, STATUS_CANNOT_UNDERSTAND)
                            .with_error_comment("dataset could not be decoded"),
                    );
                }
                None => {
                    return Some(
                        Command::response_to(request, STATUS_CANNOT_UNDERSTAND)
                            .with_error_comment("no dataset"),
                    );
                }
            };
            let status = match handler.on_transmit(&sop_class, &sop_instance, obj).await {
                Ok(()) => STATUS_SUCCESS,
                Err(SyncError::Validation(reason)) => {
                    warn!("入站对象无效: {}", reason);
                    STATUS_CANNOT_UNDERSTAND
                }
                Err(e) => {
                    error!("入站对象持久化失败: {}", e);
                    STATUS_OUT_OF_RESOURCES
                }
            };
            Some(Command::response_to(request, status))
        }
        CommandType::CMove => {
            let identifier = message
                .dataset
                .as_deref()
                .and_then(|data| TransferSyntaxManager::decode_dataset(data, transfer_syntax).ok());
            let destination = request.move_destination.clone().unwrap_or_default();
            let status = handler
                .on_relocate_request(identifier.as_ref(), &destination)
                .await;
            let mut response = Command::response_to(request, status);
            response.remaining = Some(0);
            response.completed = Some(0);
            response.failed = Some(0);
            response.warning = Some(0);
            Some(response)
        }
        CommandType::CCancel => None,
        CommandType::CFind | CommandType::Unknown(_) => {
            warn!("不支持的操作 0x{:04x}", request.command_field);
            Some(Command::response_to(request, STATUS_UNRECOGNIZED_OPERATION))
        }
    }
}

/// 监听器服务，由进程入口持有
pub struct ListenerService {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ListenerService {
    pub fn start(listener: StorageListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.serve(shutdown.clone()));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接受新连接并等待进行中的关联
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("监听器任务异常: {e}")))?
    }
}
