//! DIMSE消息处理
//!
//! 命令集固定以隐式VR小端编码，并在最前面带上组长度 (0000,0000)。

use crate::pdu::{fragment, PDataValue, Pdu, PduCodec};
use crate::transfer_syntax::{transfer_syntax_uids, trim_uid, TransferSyntaxManager};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::InMemDicomObject;
use futures_util::{SinkExt, StreamExt};
use gfr_core::{Result, SyncError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// 命令集标签
pub mod command_tags {
    use dicom::core::Tag;

    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    pub const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
}

/// 命令字段
pub mod command_fields {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_FIND_RSP: u16 = 0x8020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_MOVE_RSP: u16 = 0x8021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
    pub const C_CANCEL_RQ: u16 = 0x0FFF;
}

const DATA_SET_ABSENT: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;
const PRIORITY_MEDIUM: u16 = 0x0000;

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    CStore,
    CFind,
    CMove,
    CEcho,
    CCancel,
    Unknown(u16),
}

/// DICOM命令集
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub command_field: u16,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub move_destination: Option<String>,
    pub priority: Option<u16>,
    pub has_dataset: bool,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl Command {
    pub fn find_rq(message_id: u16, sop_class_uid: &str) -> Self {
        Self::request(command_fields::C_FIND_RQ, message_id, sop_class_uid, true)
    }

    pub fn move_rq(message_id: u16, sop_class_uid: &str, destination: &str) -> Self {
        Self {
            move_destination: Some(destination.to_string()),
            ..Self::request(command_fields::C_MOVE_RQ, message_id, sop_class_uid, true)
        }
    }

    pub fn store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self {
            affected_sop_instance_uid: Some(sop_instance_uid.to_string()),
            ..Self::request(command_fields::C_STORE_RQ, message_id, sop_class_uid, true)
        }
    }

    pub fn echo_rq(message_id: u16, sop_class_uid: &str) -> Self {
        Self {
            priority: None,
            ..Self::request(command_fields::C_ECHO_RQ, message_id, sop_class_uid, false)
        }
    }

    fn request(command_field: u16, message_id: u16, sop_class_uid: &str, has_dataset: bool) -> Self {
        Self {
            command_field,
            message_id: Some(message_id),
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            priority: Some(PRIORITY_MEDIUM),
            has_dataset,
            ..Default::default()
        }
    }

    /// 构造对某个请求的响应
    pub fn response_to(request: &Command, status: u16) -> Self {
        Self {
            command_field: request.command_field | 0x8000,
            message_id_being_responded_to: request.message_id,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        self.error_comment = Some(comment.into());
        self
    }

    pub fn is_response(&self) -> bool {
        self.command_field & 0x8000 != 0
    }

    /// 获取命令类型（请求与响应共用）
    pub fn command_type(&self) -> CommandType {
        match self.command_field & 0x7FFF {
            command_fields::C_STORE_RQ => CommandType::CStore,
            command_fields::C_FIND_RQ => CommandType::CFind,
            command_fields::C_MOVE_RQ => CommandType::CMove,
            command_fields::C_ECHO_RQ => CommandType::CEcho,
            command_fields::C_CANCEL_RQ => CommandType::CCancel,
            other => CommandType::Unknown(other),
        }
    }
}

/// 编码命令集
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    use command_tags::*;

    let mut obj = InMemDicomObject::new_empty();
    let put_us = |obj: &mut InMemDicomObject, tag: Tag, value: Option<u16>| {
        if let Some(v) = value {
            obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(v)));
        }
    };
    put_us(&mut obj, COMMAND_FIELD, Some(command.command_field));
    put_us(&mut obj, MESSAGE_ID, command.message_id);
    put_us(&mut obj, MESSAGE_ID_BEING_RESPONDED_TO, command.message_id_being_responded_to);
    put_us(&mut obj, PRIORITY, command.priority);
    put_us(
        &mut obj,
        COMMAND_DATA_SET_TYPE,
        Some(if command.has_dataset {
            DATA_SET_PRESENT
        } else {
            DATA_SET_ABSENT
        }),
    );
    put_us(&mut obj, STATUS, command.status);
    put_us(&mut obj, NUMBER_OF_REMAINING_SUBOPERATIONS, command.remaining);
    put_us(&mut obj, NUMBER_OF_COMPLETED_SUBOPERATIONS, command.completed);
    put_us(&mut obj, NUMBER_OF_FAILED_SUBOPERATIONS, command.failed);
    put_us(&mut obj, NUMBER_OF_WARNING_SUBOPERATIONS, command.warning);

    let strings = [
        (AFFECTED_SOP_CLASS_UID, VR::UI, &command.affected_sop_class_uid),
        (AFFECTED_SOP_INSTANCE_UID, VR::UI, &command.affected_sop_instance_uid),
        (MOVE_DESTINATION, VR::AE, &command.move_destination),
        (ERROR_COMMENT, VR::LO, &command.error_comment),
    ];
    for (tag, vr, value) in strings {
        if let Some(v) = value {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(v.as_str())));
        }
    }

    let body =
        TransferSyntaxManager::encode_dataset(&obj, transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN)?;

    // 组长度元素：标签(4) 长度(4) 值(4)
    let mut encoded = Vec::with_capacity(body.len() + 12);
    encoded.extend_from_slice(&[0, 0, 0, 0, 4, 0, 0, 0]);
    encoded.extend_from_slice(&(body.len() as u32).to_le_bytes());
    encoded.extend_from_slice(&body);
    Ok(encoded)
}

/// 解码命令集
pub fn decode_command(data: &[u8]) -> Result<Command> {
    use command_tags::*;

    let obj =
        TransferSyntaxManager::decode_dataset(data, transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN)?;

    let us = |tag: Tag| -> Option<u16> {
        obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
    };
    let text = |tag: Tag| -> Option<String> {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| trim_uid(s.as_ref()).trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let command_field = us(COMMAND_FIELD)
        .ok_or_else(|| SyncError::Decode("命令集缺少 CommandField".into()))?;

    Ok(Command {
        command_field,
        message_id: us(MESSAGE_ID),
        message_id_being_responded_to: us(MESSAGE_ID_BEING_RESPONDED_TO),
        affected_sop_class_uid: text(AFFECTED_SOP_CLASS_UID),
        affected_sop_instance_uid: text(AFFECTED_SOP_INSTANCE_UID),
        move_destination: text(MOVE_DESTINATION),
        priority: us(PRIORITY),
        has_dataset: us(COMMAND_DATA_SET_TYPE).is_some_and(|t| t != DATA_SET_ABSENT),
        status: us(STATUS),
        error_comment: text(ERROR_COMMENT),
        remaining: us(NUMBER_OF_REMAINING_SUBOPERATIONS),
        completed: us(NUMBER_OF_COMPLETED_SUBOPERATIONS),
        failed: us(NUMBER_OF_FAILED_SUBOPERATIONS),
        warning: us(NUMBER_OF_WARNING_SUBOPERATIONS),
    })
}

/// 一个完整的DIMSE消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseMessage {
    pub context_id: u8,
    pub command: Command,
    /// 按协商的传输语法编码的数据集
    pub dataset: Option<Vec<u8>>,
}

/// 将PDV片段组装为DIMSE消息
#[derive(Debug, Default)]
pub struct MessageAssembler {
    context_id: Option<u8>,
    command_bytes: Vec<u8>,
    command: Option<Command>,
    dataset_bytes: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个片段，消息完整时返回
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.context_id {
            Some(id) if id != pdv.context_id => {
                return Err(SyncError::Dicom(format!(
                    "同一消息中出现不同的表示上下文: {} / {}",
                    id, pdv.context_id
                )));
            }
            _ => self.context_id = Some(pdv.context_id),
        }

        if pdv.is_command {
            if self.command.is_some() {
                return Err(SyncError::Dicom("数据集完成前收到新的命令片段".into()));
            }
            self.command_bytes.extend_from_slice(&pdv.data);
            if pdv.is_last {
                let command = decode_command(&std::mem::take(&mut self.command_bytes))?;
                if !command.has_dataset {
                    return Ok(Some(self.finish(command, None)));
                }
                self.command = Some(command);
            }
        } else {
            if self.command.is_none() {
                return Err(SyncError::Dicom("命令集完成前收到数据集片段".into()));
            }
            self.dataset_bytes.extend_from_slice(&pdv.data);
            if pdv.is_last {
                if let Some(command) = self.command.take() {
                    let dataset = std::mem::take(&mut self.dataset_bytes);
                    return Ok(Some(self.finish(command, Some(dataset))));
                }
            }
        }
        Ok(None)
    }

    fn finish(&mut self, command: Command, dataset: Option<Vec<u8>>) -> DimseMessage {
        let context_id = self.context_id.take().unwrap_or_default();
        self.command_bytes.clear();
        self.dataset_bytes.clear();
        DimseMessage {
            context_id,
            command,
            dataset,
        }
    }
}

/// 从对端读到的下一个事件
#[derive(Debug)]
pub enum Inbound {
    Message(DimseMessage),
    ReleaseRequested,
    ReleaseConfirmed,
    Aborted,
    Closed,
}

/// 读取下一个完整消息或控制PDU
pub async fn read_message<S>(
    framed: &mut Framed<S, PduCodec>,
    assembler: &mut MessageAssembler,
) -> Result<Inbound>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let pdu = match framed.next().await {
            Some(pdu) => pdu?,
            None => return Ok(Inbound::Closed),
        };
        match pdu {
            Pdu::PData(values) => {
                for pdv in values {
                    if let Some(message) = assembler.push(pdv)? {
                        return Ok(Inbound::Message(message));
                    }
                }
            }
            Pdu::ReleaseRq => return Ok(Inbound::ReleaseRequested),
            Pdu::ReleaseRp => return Ok(Inbound::ReleaseConfirmed),
            Pdu::Abort { source, reason } => {
                warn!("对端中止关联: source={} reason={}", source, reason);
                return Ok(Inbound::Aborted);
            }
            other => {
                return Err(SyncError::Dicom(format!(
                    "关联建立后收到意外的 {}",
                    other.name()
                )));
            }
        }
    }
}

/// 分片发送一个消息
pub async fn send_message<S>(
    framed: &mut Framed<S, PduCodec>,
    context_id: u8,
    command: &Command,
    dataset: Option<&[u8]>,
    peer_max_pdu_length: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = encode_command(command)?;
    debug!(
        "发送命令 0x{:04x} (上下文 {}, {} 字节)",
        command.command_field,
        context_id,
        encoded.len()
    );
    for pdu in fragment(context_id, true, &encoded, peer_max_pdu_length) {
        framed.feed(pdu).await?;
    }
    if let Some(data) = dataset {
        for pdu in fragment(context_id, false, data, peer_max_pdu_length) {
            framed.feed(pdu).await?;
        }
    }
    framed.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::STATUS_PENDING;

    #[test]
    fn test_command_encoding_starts_with_group_length() {
        let command = Command::find_rq(7, "1.2.840.10008.5.1.4.1.2.2.1");
        let encoded = encode_command(&command).unwrap();
        assert_eq!(&encoded[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]);
        assert_eq!(group_length as usize, encoded.len() - 12);

        let decoded = decode_command(&encoded).unwrap();
        assert_eq!(decoded.command_type(), CommandType::CFind);
        assert_eq!(decoded.message_id, Some(7));
        assert!(decoded.has_dataset);
        assert_eq!(
            decoded.affected_sop_class_uid.as_deref(),
            Some("1.2.840.10008.5.1.4.1.2.2.1")
        );
    }

    #[test]
    fn test_response_mirrors_request() {
        let request = Command::store_rq(3, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4");
        let response = Command::response_to(&request, 0x0000);
        assert_eq!(response.command_field, command_fields::C_STORE_RSP);
        assert!(response.is_response());
        assert_eq!(response.message_id_being_responded_to, Some(3));
        assert_eq!(response.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
        assert!(!response.has_dataset);

        let decoded = decode_command(&encode_command(&response).unwrap()).unwrap();
        assert_eq!(decoded.status, Some(0x0000));
        assert_eq!(decoded.command_type(), CommandType::CStore);
    }

    #[test]
    fn test_assembler_joins_fragments() {
        let mut command = Command::response_to(&Command::find_rq(1, "1.2"), STATUS_PENDING);
        command.has_dataset = true;
        let encoded = encode_command(&command).unwrap();
        let (head, tail) = encoded.split_at(10);

        let mut assembler = MessageAssembler::new();
        let pdv = |is_command, is_last, data: &[u8]| PDataValue {
            context_id: 1,
            is_command,
            is_last,
            data: data.to_vec(),
        };
        assert!(assembler.push(pdv(true, false, head)).unwrap().is_none());
        assert!(assembler.push(pdv(true, true, tail)).unwrap().is_none());
        assert!(assembler.push(pdv(false, false, b"ab")).unwrap().is_none());
        let message = assembler.push(pdv(false, true, b"cd")).unwrap().unwrap();
        assert_eq!(message.context_id, 1);
        assert_eq!(message.command.status, Some(STATUS_PENDING));
        assert_eq!(message.dataset.as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn test_assembler_rejects_dataset_without_command() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.push(PDataValue {
            context_id: 1,
            is_command: false,
            is_last: true,
            data: vec![1, 2],
        });
        assert!(result.is_err());
    }
}
