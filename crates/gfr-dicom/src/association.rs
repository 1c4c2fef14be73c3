//! DICOM关联管理
//!
//! 每个关联只协商一个表示上下文，对应一种操作。查询和迁移的响应按需逐个读取；
//! 上一个响应序列未读完之前，同一关联不接受新的操作。

use crate::dimse::{read_message, send_message, Command, Inbound, MessageAssembler};
use crate::pdu::{
    AssociateRq, Pdu, PduCodec, PresentationContextProposal, PresentationContextResult,
    UserInformation, DEFAULT_MAX_PDU_LENGTH,
};
use crate::status::{classify, DimseStatus, TransmitStatus};
use crate::transfer_syntax::{
    trim_uid, ServiceContext, TransferSyntaxManager, APPLICATION_CONTEXT_NAME,
};
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures_util::{SinkExt, StreamExt};
use gfr_core::utils::{generate_dicom_uid, is_valid_ae_title};
use gfr_core::{ConnectionError, RemoteNode, Result, SyncError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// 本实现的类UID
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.9.7382.1";
/// 本实现的版本名
pub const IMPLEMENTATION_VERSION_NAME: &str = "GFRSYNC_010";

const CONTEXT_ID: u8 = 1;

/// 关联各阶段的超时
#[derive(Debug, Clone, Copy)]
pub struct AssociationTimeouts {
    /// TCP连接与关联协商
    pub connect: Duration,
    /// 等待单个响应
    pub response: Duration,
}

impl Default for AssociationTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            response: Duration::from_secs(30),
        }
    }
}

/// 一个查询/迁移响应
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub status: DimseStatus,
    pub code: u16,
    /// 待续响应携带的标识
    pub identifier: Option<InMemDicomObject>,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
}

/// 进行中的操作
#[derive(Debug, Clone, Copy)]
struct PendingOperation {
    message_id: u16,
    name: &'static str,
}

/// 已建立的关联
pub struct Association {
    framed: Framed<TcpStream, PduCodec>,
    assembler: MessageAssembler,
    context: ServiceContext,
    transfer_syntax: String,
    peer_max_pdu_length: u32,
    remote: String,
    message_id: u16,
    response_timeout: Duration,
    pending: Option<PendingOperation>,
    closed: bool,
}

/// 建立关联；只有对方明确接受了上下文才返回
pub async fn connect(
    local_ae: &str,
    host: &str,
    port: u16,
    remote_ae: &str,
    context: ServiceContext,
    timeouts: AssociationTimeouts,
) -> std::result::Result<Association, ConnectionError> {
    if !is_valid_ae_title(local_ae) {
        return Err(ConnectionError::InvalidParameters(format!(
            "本地AE标题无效: {local_ae:?}"
        )));
    }
    if !is_valid_ae_title(remote_ae) {
        return Err(ConnectionError::InvalidParameters(format!(
            "远程AE标题无效: {remote_ae:?}"
        )));
    }
    if host.trim().is_empty() || port == 0 {
        return Err(ConnectionError::InvalidParameters(format!(
            "远程地址无效: {host}:{port}"
        )));
    }

    let remote = format!("{remote_ae}@{host}:{port}");
    match timeout(timeouts.connect, negotiate(local_ae, host, port, remote_ae, context, timeouts)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(remote)),
    }
}

async fn negotiate(
    local_ae: &str,
    host: &str,
    port: u16,
    remote_ae: &str,
    context: ServiceContext,
    timeouts: AssociationTimeouts,
) -> std::result::Result<Association, ConnectionError> {
    let remote = format!("{remote_ae}@{host}:{port}");
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ConnectionError::ConnectionRefused(format!("{remote}: {e}")))?;
    let mut framed = Framed::new(stream, PduCodec::new(DEFAULT_MAX_PDU_LENGTH));

    let request = AssociateRq {
        called_ae_title: remote_ae.to_string(),
        calling_ae_title: local_ae.to_string(),
        application_context: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![PresentationContextProposal {
            id: CONTEXT_ID,
            abstract_syntax: context.abstract_syntax().to_string(),
            transfer_syntaxes: TransferSyntaxManager::proposed(),
        }],
        user_information: UserInformation {
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
        },
    };
    framed
        .send(Pdu::AssociateRq(request))
        .await
        .map_err(|e| ConnectionError::ConnectionRefused(format!("{remote}: {e}")))?;

    let answer = match framed.next().await {
        Some(Ok(pdu)) => pdu,
        Some(Err(e)) => return Err(ConnectionError::ConnectionRefused(format!("{remote}: {e}"))),
        None => {
            return Err(ConnectionError::ConnectionRefused(format!(
                "{remote}: 对方关闭了连接"
            )))
        }
    };

    let accept = match answer {
        Pdu::AssociateAc(accept) => accept,
        Pdu::AssociateRj(reject) => {
            return Err(ConnectionError::ConnectionRefused(format!(
                "{remote}: 关联被拒绝 (result={}, source={}, reason={})",
                reject.result, reject.source, reject.reason
            )));
        }
        other => {
            return Err(ConnectionError::ConnectionRefused(format!(
                "{remote}: 协商时收到 {}",
                other.name()
            )));
        }
    };

    let negotiated = accept
        .presentation_contexts
        .iter()
        .find(|pc| pc.id == CONTEXT_ID)
        .filter(|pc| {
            pc.result == PresentationContextResult::Acceptance
                && TransferSyntaxManager::is_supported(&pc.transfer_syntax)
        });
    let transfer_syntax = match negotiated {
        Some(pc) => trim_uid(&pc.transfer_syntax).to_string(),
        None => {
            let _ = framed.send(Pdu::Abort { source: 0, reason: 0 }).await;
            return Err(ConnectionError::ContextRejected(format!(
                "{remote}: {}",
                context.abstract_syntax()
            )));
        }
    };

    // 对方不限制时按默认长度分片
    let peer_max_pdu_length = match accept.user_information.max_pdu_length {
        0 => DEFAULT_MAX_PDU_LENGTH,
        n => n,
    };

    info!("关联已建立: {} -> {} ({})", local_ae, remote, context.abstract_syntax());
    Ok(Association {
        framed,
        assembler: MessageAssembler::new(),
        context,
        transfer_syntax,
        peer_max_pdu_length,
        remote,
        message_id: 0,
        response_timeout: timeouts.response,
        pending: None,
        closed: false,
    })
}

impl Association {
    /// 协商得到的传输语法
    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// 是否有未读完的响应序列
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// 发起 C-FIND，返回响应游标
    pub async fn find(&mut self, query: &InMemDicomObject) -> Result<Responses<'_>> {
        self.start_find(query).await?;
        Ok(Responses { association: self })
    }

    /// 发起 C-MOVE，返回响应游标
    pub async fn relocate(
        &mut self,
        destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<Responses<'_>> {
        self.start_relocate(destination, identifier).await?;
        Ok(Responses { association: self })
    }

    /// 发送一个对象 (C-STORE)
    pub async fn transmit(&mut self, obj: &InMemDicomObject) -> Result<TransmitStatus> {
        let sop_class_uid = match &self.context {
            ServiceContext::Transmit { sop_class_uid } => sop_class_uid.clone(),
            other => return Err(self.wrong_context("C-STORE", other)),
        };
        self.ensure_idle()?;
        let sop_instance_uid = obj
            .element(tags::SOP_INSTANCE_UID)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| trim_uid(s.trim()).to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_dicom_uid);

        let message_id = self.next_message_id();
        let dataset = TransferSyntaxManager::encode_dataset(obj, &self.transfer_syntax)?;
        let command = Command::store_rq(message_id, &sop_class_uid, &sop_instance_uid);
        self.send(&command, Some(&dataset)).await?;

        let response = self.read_response(message_id).await?;
        let code = response.command.status.unwrap_or(0xC000);
        debug!("C-STORE 响应 {:#06x} ({})", code, sop_instance_uid);
        Ok(TransmitStatus::from_code(code))
    }

    /// 验证连通性 (C-ECHO)
    pub async fn echo(&mut self) -> Result<()> {
        if self.context != ServiceContext::Verification {
            let context = self.context.clone();
            return Err(self.wrong_context("C-ECHO", &context));
        }
        self.ensure_idle()?;
        let message_id = self.next_message_id();
        let command = Command::echo_rq(message_id, self.context.abstract_syntax());
        self.send(&command, None).await?;
        let response = self.read_response(message_id).await?;
        match response.command.status.map(classify) {
            Some(DimseStatus::Success) => Ok(()),
            _ => Err(SyncError::ProtocolStatus {
                operation: "C-ECHO".into(),
                status: response.command.status.unwrap_or(0xC000),
            }),
        }
    }

    /// 正常释放关联
    pub async fn release(mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // 响应序列未读完时对端不会接受释放请求
        if let Some(op) = self.pending.take() {
            warn!("{} 响应未读完，中止关联: {}", op.name, self.remote);
            self.abort().await;
            return Ok(());
        }
        self.closed = true;
        self.framed.send(Pdu::ReleaseRq).await?;

        let response_timeout = self.response_timeout;
        let remote = self.remote.clone();
        let wait = async {
            loop {
                match read_message(&mut self.framed, &mut self.assembler).await? {
                    Inbound::ReleaseConfirmed | Inbound::Closed | Inbound::Aborted => {
                        return Ok::<(), SyncError>(())
                    }
                    Inbound::ReleaseRequested => {
                        self.framed.send(Pdu::ReleaseRp).await?;
                        return Ok(());
                    }
                    Inbound::Message(message) => {
                        debug!("释放时忽略迟到的消息 0x{:04x}", message.command.command_field);
                    }
                }
            }
        };
        match timeout(response_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => warn!("等待 A-RELEASE-RP 超时: {}", remote),
        }
        debug!("关联已释放: {}", remote);
        Ok(())
    }

    /// 中止关联
    pub async fn abort(mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.framed.send(Pdu::Abort { source: 0, reason: 0 }).await;
        }
    }

    async fn start_find(&mut self, query: &InMemDicomObject) -> Result<()> {
        if self.context != ServiceContext::Query {
            let context = self.context.clone();
            return Err(self.wrong_context("C-FIND", &context));
        }
        self.ensure_idle()?;
        let message_id = self.next_message_id();
        let dataset = TransferSyntaxManager::encode_dataset(query, &self.transfer_syntax)?;
        let command = Command::find_rq(message_id, self.context.abstract_syntax());
        self.send(&command, Some(&dataset)).await?;
        self.pending = Some(PendingOperation {
            message_id,
            name: "C-FIND",
        });
        Ok(())
    }

    async fn start_relocate(
        &mut self,
        destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<()> {
        if self.context != ServiceContext::Relocate {
            let context = self.context.clone();
            return Err(self.wrong_context("C-MOVE", &context));
        }
        if !is_valid_ae_title(destination) {
            return Err(SyncError::Validation(format!(
                "迁移目的AE无效: {destination:?}"
            )));
        }
        self.ensure_idle()?;
        let message_id = self.next_message_id();
        let dataset = TransferSyntaxManager::encode_dataset(identifier, &self.transfer_syntax)?;
        let command = Command::move_rq(message_id, self.context.abstract_syntax(), destination);
        self.send(&command, Some(&dataset)).await?;
        self.pending = Some(PendingOperation {
            message_id,
            name: "C-MOVE",
        });
        Ok(())
    }

    /// 读取当前操作的下一个响应；序列结束后返回 None
    async fn next_pending_response(&mut self) -> Option<Result<DimseResponse>> {
        let op = self.pending?;
        let message = match self.read_response(op.message_id).await {
            Ok(message) => message,
            Err(e) => {
                self.pending = None;
                return Some(Err(e));
            }
        };

        let code = message.command.status.unwrap_or(0xC000);
        let status = classify(code);
        if status.is_final() {
            self.pending = None;
        }
        if let DimseStatus::Failure(code) = status {
            return Some(Err(SyncError::ProtocolStatus {
                operation: op.name.to_string(),
                status: code,
            }));
        }

        // 单个结果解码失败时操作仍在进行，调用方丢弃该结果后可继续读取
        let identifier = match (status, message.dataset) {
            (DimseStatus::Pending, Some(data)) => {
                match TransferSyntaxManager::decode_dataset(&data, &self.transfer_syntax) {
                    Ok(obj) => Some(obj),
                    Err(e) => {
                        return Some(Err(SyncError::Decode(format!(
                            "{} 结果无法解码: {e}",
                            op.name
                        ))))
                    }
                }
            }
            _ => None,
        };

        Some(Ok(DimseResponse {
            status,
            code,
            identifier,
            remaining: message.command.remaining,
            completed: message.command.completed,
            failed: message.command.failed,
        }))
    }

    async fn send(&mut self, command: &Command, dataset: Option<&[u8]>) -> Result<()> {
        if self.closed {
            return Err(SyncError::Dicom(format!("关联已关闭: {}", self.remote)));
        }
        send_message(
            &mut self.framed,
            CONTEXT_ID,
            command,
            dataset,
            self.peer_max_pdu_length,
        )
        .await
    }

    /// 读取对指定消息的响应，忽略其他消息
    async fn read_response(&mut self, message_id: u16) -> Result<crate::dimse::DimseMessage> {
        loop {
            let inbound = timeout(
                self.response_timeout,
                read_message(&mut self.framed, &mut self.assembler),
            )
            .await
            .map_err(|_| SyncError::Timeout(format!("等待 {} 的响应", self.remote)))??;

            match inbound {
                Inbound::Message(message)
                    if message.command.is_response()
                        && message.command.message_id_being_responded_to == Some(message_id) =>
                {
                    return Ok(message);
                }
                Inbound::Message(message) => {
                    warn!(
                        "忽略无关消息 0x{:04x} (来自 {})",
                        message.command.command_field, self.remote
                    );
                }
                Inbound::ReleaseRequested
                | Inbound::ReleaseConfirmed
                | Inbound::Aborted
                | Inbound::Closed => {
                    self.closed = true;
                    return Err(SyncError::Dicom(format!(
                        "关联在响应序列中途结束: {}",
                        self.remote
                    )));
                }
            }
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.pending {
            Some(op) => Err(SyncError::Dicom(format!(
                "{} 的响应序列尚未结束，不能开始新操作",
                op.name
            ))),
            None => Ok(()),
        }
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    fn wrong_context(&self, operation: &str, context: &ServiceContext) -> SyncError {
        SyncError::Dicom(format!(
            "{operation} 不能在 {} 上下文中执行",
            context.abstract_syntax()
        ))
    }
}

/// 查询/迁移响应游标；借用关联直到序列结束
pub struct Responses<'a> {
    association: &'a mut Association,
}

impl Responses<'_> {
    /// 下一个响应；成功、取消或失败状态之后返回 None
    pub async fn next(&mut self) -> Option<Result<DimseResponse>> {
        self.association.next_pending_response().await
    }
}

/// 轮询流程使用的关联抽象
#[async_trait]
pub trait DimseSession: Send {
    async fn begin_find(&mut self, query: &InMemDicomObject) -> Result<()>;

    async fn begin_relocate(
        &mut self,
        destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<()>;

    async fn next_response(&mut self) -> Option<Result<DimseResponse>>;

    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl DimseSession for Association {
    async fn begin_find(&mut self, query: &InMemDicomObject) -> Result<()> {
        self.start_find(query).await
    }

    async fn begin_relocate(
        &mut self,
        destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<()> {
        self.start_relocate(destination, identifier).await
    }

    async fn next_response(&mut self) -> Option<Result<DimseResponse>> {
        self.next_pending_response().await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        Association::release(*self).await
    }
}

/// 关联工厂
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        local_ae: &str,
        node: &RemoteNode,
        context: ServiceContext,
    ) -> std::result::Result<Box<dyn DimseSession>, ConnectionError>;
}

/// 通过TCP建立真实关联
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    timeouts: AssociationTimeouts,
}

impl NetworkConnector {
    pub fn new(timeouts: AssociationTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(
        &self,
        local_ae: &str,
        node: &RemoteNode,
        context: ServiceContext,
    ) -> std::result::Result<Box<dyn DimseSession>, ConnectionError> {
        let association = connect(
            local_ae,
            &node.host,
            node.port,
            &node.ae_title,
            context,
            self.timeouts,
        )
        .await?;
        Ok(Box::new(association))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_parameters_rejected_before_connecting() {
        let timeouts = AssociationTimeouts::default();
        let err = connect("", "127.0.0.1", 104, "PACS", ServiceContext::Query, timeouts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::InvalidParameters(_)));

        let err = connect("RH_EDTA", "127.0.0.1", 0, "PACS", ServiceContext::Query, timeouts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // 绑定后立即释放，得到一个大概率无人监听的端口
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect(
            "RH_EDTA",
            "127.0.0.1",
            port,
            "PACS",
            ServiceContext::Query,
            AssociationTimeouts::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ConnectionError::ConnectionRefused(_)));
    }
}
