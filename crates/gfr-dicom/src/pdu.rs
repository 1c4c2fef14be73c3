//! 上层协议 PDU 编解码
//!
//! PDU 头固定为 `类型(1) 保留(1) 长度(4, 大端)`，关联类 PDU 的可变字段由
//! `类型(1) 保留(1) 长度(2)` 的子项组成。

use bytes::{Buf, BufMut, BytesMut};
use gfr_core::{Result, SyncError};
use tokio_util::codec::{Decoder, Encoder};

/// 默认最大 PDU 长度
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;

/// 非 P-DATA PDU 的长度上限
const CONTROL_PDU_LIMIT: usize = 64 * 1024;

const PDU_HEADER_LEN: usize = 6;
const PDV_HEADER_LEN: usize = 6;

const PDU_ASSOCIATE_RQ: u8 = 0x01;
const PDU_ASSOCIATE_AC: u8 = 0x02;
const PDU_ASSOCIATE_RJ: u8 = 0x03;
const PDU_P_DATA_TF: u8 = 0x04;
const PDU_RELEASE_RQ: u8 = 0x05;
const PDU_RELEASE_RP: u8 = 0x06;
const PDU_ABORT: u8 = 0x07;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const SUB_ITEM_MAX_LENGTH: u8 = 0x51;
const SUB_ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const SUB_ITEM_IMPLEMENTATION_VERSION: u8 = 0x55;

/// 请求方提议的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 表示上下文协商结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxNotSupported,
}

impl PresentationContextResult {
    fn code(self) -> u8 {
        match self {
            PresentationContextResult::Acceptance => 0,
            PresentationContextResult::UserRejection => 1,
            PresentationContextResult::NoReason => 2,
            PresentationContextResult::AbstractSyntaxNotSupported => 3,
            PresentationContextResult::TransferSyntaxNotSupported => 4,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => PresentationContextResult::Acceptance,
            1 => PresentationContextResult::UserRejection,
            3 => PresentationContextResult::AbstractSyntaxNotSupported,
            4 => PresentationContextResult::TransferSyntaxNotSupported,
            _ => PresentationContextResult::NoReason,
        }
    }
}

/// 接受方返回的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub result: PresentationContextResult,
    pub transfer_syntax: String,
}

/// 用户信息项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInformation {
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    pub result: u8,
    pub source: u8,
    pub reason: u8,
}

/// P-DATA 中的一个数据值项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// 协议数据单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    PData(Vec<PDataValue>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    /// 用于日志的简短名称
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj(_) => "A-ASSOCIATE-RJ",
            Pdu::PData(_) => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

/// 将一个消息片段拆分为不超过对方最大 PDU 长度的 P-DATA PDU
pub fn fragment(context_id: u8, is_command: bool, data: &[u8], max_pdu_length: u32) -> Vec<Pdu> {
    let chunk = if max_pdu_length == 0 {
        data.len().max(1)
    } else {
        (max_pdu_length as usize).saturating_sub(PDV_HEADER_LEN).max(1)
    };

    if data.is_empty() {
        return vec![Pdu::PData(vec![PDataValue {
            context_id,
            is_command,
            is_last: true,
            data: Vec::new(),
        }])];
    }

    let count = data.len().div_ceil(chunk);
    data.chunks(chunk)
        .enumerate()
        .map(|(i, part)| {
            Pdu::PData(vec![PDataValue {
                context_id,
                is_command,
                is_last: i + 1 == count,
                data: part.to_vec(),
            }])
        })
        .collect()
}

/// DICOM上层协议编解码器
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_pdu_length: u32,
}

impl PduCodec {
    /// `max_pdu_length` 是本端通告、也是本端愿意接收的 P-DATA 长度上限
    pub fn new(max_pdu_length: u32) -> Self {
        Self { max_pdu_length }
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PDU_LENGTH)
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_type = src[0];
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        let limit = if pdu_type == PDU_P_DATA_TF && self.max_pdu_length > 0 {
            self.max_pdu_length as usize
        } else {
            CONTROL_PDU_LIMIT.max(self.max_pdu_length as usize)
        };
        if length > limit {
            return Err(SyncError::Decode(format!(
                "PDU 0x{pdu_type:02x} 长度 {length} 超过上限 {limit}"
            )));
        }

        let total_length = PDU_HEADER_LEN + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total_length);
        let mut body: &[u8] = &frame[PDU_HEADER_LEN..];

        let pdu = match pdu_type {
            PDU_ASSOCIATE_RQ => Pdu::AssociateRq(decode_associate_rq(&mut body)?),
            PDU_ASSOCIATE_AC => Pdu::AssociateAc(decode_associate_ac(&mut body)?),
            PDU_ASSOCIATE_RJ => {
                let fields = take(&mut body, 4)?;
                Pdu::AssociateRj(AssociateRj {
                    result: fields[1],
                    source: fields[2],
                    reason: fields[3],
                })
            }
            PDU_P_DATA_TF => Pdu::PData(decode_pdata(&mut body)?),
            PDU_RELEASE_RQ => Pdu::ReleaseRq,
            PDU_RELEASE_RP => Pdu::ReleaseRp,
            PDU_ABORT => {
                let fields = take(&mut body, 4)?;
                Pdu::Abort {
                    source: fields[2],
                    reason: fields[3],
                }
            }
            other => {
                return Err(SyncError::Decode(format!("未知的PDU类型: 0x{other:02x}")));
            }
        };

        Ok(Some(pdu))
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = SyncError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let pdu_type = match &item {
            Pdu::AssociateRq(rq) => {
                put_association_header(&mut body, &rq.called_ae_title, &rq.calling_ae_title);
                put_item(&mut body, ITEM_APPLICATION_CONTEXT, rq.application_context.as_bytes())?;
                for pc in &rq.presentation_contexts {
                    let mut sub = BytesMut::new();
                    sub.put_slice(&[pc.id, 0, 0, 0]);
                    put_item(&mut sub, ITEM_ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes())?;
                    for ts in &pc.transfer_syntaxes {
                        put_item(&mut sub, ITEM_TRANSFER_SYNTAX, ts.as_bytes())?;
                    }
                    put_item(&mut body, ITEM_PRESENTATION_CONTEXT_RQ, &sub)?;
                }
                put_user_information(&mut body, &rq.user_information)?;
                PDU_ASSOCIATE_RQ
            }
            Pdu::AssociateAc(ac) => {
                put_association_header(&mut body, &ac.called_ae_title, &ac.calling_ae_title);
                put_item(&mut body, ITEM_APPLICATION_CONTEXT, ac.application_context.as_bytes())?;
                for pc in &ac.presentation_contexts {
                    let mut sub = BytesMut::new();
                    sub.put_slice(&[pc.id, 0, pc.result.code(), 0]);
                    put_item(&mut sub, ITEM_TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes())?;
                    put_item(&mut body, ITEM_PRESENTATION_CONTEXT_AC, &sub)?;
                }
                put_user_information(&mut body, &ac.user_information)?;
                PDU_ASSOCIATE_AC
            }
            Pdu::AssociateRj(rj) => {
                body.put_slice(&[0, rj.result, rj.source, rj.reason]);
                PDU_ASSOCIATE_RJ
            }
            Pdu::PData(values) => {
                for pdv in values {
                    let control = u8::from(pdv.is_command) | (u8::from(pdv.is_last) << 1);
                    body.put_u32((pdv.data.len() + 2) as u32);
                    body.put_u8(pdv.context_id);
                    body.put_u8(control);
                    body.put_slice(&pdv.data);
                }
                PDU_P_DATA_TF
            }
            Pdu::ReleaseRq => {
                body.put_u32(0);
                PDU_RELEASE_RQ
            }
            Pdu::ReleaseRp => {
                body.put_u32(0);
                PDU_RELEASE_RP
            }
            Pdu::Abort { source, reason } => {
                body.put_slice(&[0, 0, *source, *reason]);
                PDU_ABORT
            }
        };

        dst.reserve(PDU_HEADER_LEN + body.len());
        dst.put_u8(pdu_type);
        dst.put_u8(0);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

fn put_association_header(body: &mut BytesMut, called: &str, calling: &str) {
    body.put_u16(1); // 协议版本
    body.put_u16(0);
    put_ae_title(body, called);
    put_ae_title(body, calling);
    body.put_slice(&[0u8; 32]);
}

fn put_ae_title(body: &mut BytesMut, ae_title: &str) {
    let mut field = [b' '; 16];
    for (slot, byte) in field.iter_mut().zip(ae_title.bytes()) {
        *slot = byte;
    }
    body.put_slice(&field);
}

fn put_item(body: &mut BytesMut, item_type: u8, value: &[u8]) -> Result<()> {
    let length = u16::try_from(value.len())
        .map_err(|_| SyncError::Dicom(format!("子项 0x{item_type:02x} 过长")))?;
    body.put_u8(item_type);
    body.put_u8(0);
    body.put_u16(length);
    body.put_slice(value);
    Ok(())
}

fn put_user_information(body: &mut BytesMut, info: &UserInformation) -> Result<()> {
    let mut sub = BytesMut::new();
    put_item(&mut sub, SUB_ITEM_MAX_LENGTH, &info.max_pdu_length.to_be_bytes())?;
    put_item(
        &mut sub,
        SUB_ITEM_IMPLEMENTATION_CLASS_UID,
        info.implementation_class_uid.as_bytes(),
    )?;
    if let Some(version) = &info.implementation_version_name {
        put_item(&mut sub, SUB_ITEM_IMPLEMENTATION_VERSION, version.as_bytes())?;
    }
    put_item(body, ITEM_USER_INFORMATION, &sub)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.remaining() < n {
        return Err(SyncError::Decode(format!(
            "PDU 被截断: 需要 {n} 字节，剩余 {}",
            buf.remaining()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// 读取下一个 `类型(1) 保留(1) 长度(2)` 子项
fn next_item<'a>(buf: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    let header = take(buf, 4)?;
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    Ok((header[0], take(buf, length)?))
}

struct AssociationHeader {
    called_ae_title: String,
    calling_ae_title: String,
}

fn decode_association_header(body: &mut &[u8]) -> Result<AssociationHeader> {
    let fixed = take(body, 68)?;
    Ok(AssociationHeader {
        called_ae_title: text(&fixed[4..20]),
        calling_ae_title: text(&fixed[20..36]),
    })
}

fn decode_user_information(mut value: &[u8]) -> Result<UserInformation> {
    let mut info = UserInformation {
        max_pdu_length: 0,
        implementation_class_uid: String::new(),
        implementation_version_name: None,
    };
    while value.has_remaining() {
        let (sub_type, sub_value) = next_item(&mut value)?;
        match sub_type {
            SUB_ITEM_MAX_LENGTH if sub_value.len() == 4 => {
                info.max_pdu_length =
                    u32::from_be_bytes([sub_value[0], sub_value[1], sub_value[2], sub_value[3]]);
            }
            SUB_ITEM_IMPLEMENTATION_CLASS_UID => info.implementation_class_uid = text(sub_value),
            SUB_ITEM_IMPLEMENTATION_VERSION => {
                info.implementation_version_name = Some(text(sub_value))
            }
            _ => {} // 异步操作窗口、角色选择等扩展协商不支持，忽略
        }
    }
    Ok(info)
}

fn decode_associate_rq(body: &mut &[u8]) -> Result<AssociateRq> {
    let header = decode_association_header(body)?;
    let mut rq = AssociateRq {
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context: String::new(),
        presentation_contexts: Vec::new(),
        user_information: UserInformation {
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
            implementation_version_name: None,
        },
    };

    while body.has_remaining() {
        let (item_type, mut value) = next_item(body)?;
        match item_type {
            ITEM_APPLICATION_CONTEXT => rq.application_context = text(value),
            ITEM_PRESENTATION_CONTEXT_RQ => {
                let fixed = take(&mut value, 4)?;
                let mut pc = PresentationContextProposal {
                    id: fixed[0],
                    abstract_syntax: String::new(),
                    transfer_syntaxes: Vec::new(),
                };
                while value.has_remaining() {
                    let (sub_type, sub_value) = next_item(&mut value)?;
                    match sub_type {
                        ITEM_ABSTRACT_SYNTAX => pc.abstract_syntax = text(sub_value),
                        ITEM_TRANSFER_SYNTAX => pc.transfer_syntaxes.push(text(sub_value)),
                        _ => {}
                    }
                }
                rq.presentation_contexts.push(pc);
            }
            ITEM_USER_INFORMATION => rq.user_information = decode_user_information(value)?,
            _ => {}
        }
    }
    Ok(rq)
}

fn decode_associate_ac(body: &mut &[u8]) -> Result<AssociateAc> {
    let header = decode_association_header(body)?;
    let mut ac = AssociateAc {
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context: String::new(),
        presentation_contexts: Vec::new(),
        user_information: UserInformation {
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
            implementation_version_name: None,
        },
    };

    while body.has_remaining() {
        let (item_type, mut value) = next_item(body)?;
        match item_type {
            ITEM_APPLICATION_CONTEXT => ac.application_context = text(value),
            ITEM_PRESENTATION_CONTEXT_AC => {
                let fixed = take(&mut value, 4)?;
                let mut pc = PresentationContextNegotiated {
                    id: fixed[0],
                    result: PresentationContextResult::from_code(fixed[2]),
                    transfer_syntax: String::new(),
                };
                while value.has_remaining() {
                    let (sub_type, sub_value) = next_item(&mut value)?;
                    if sub_type == ITEM_TRANSFER_SYNTAX {
                        pc.transfer_syntax = text(sub_value);
                    }
                }
                ac.presentation_contexts.push(pc);
            }
            ITEM_USER_INFORMATION => ac.user_information = decode_user_information(value)?,
            _ => {}
        }
    }
    Ok(ac)
}

fn decode_pdata(body: &mut &[u8]) -> Result<Vec<PDataValue>> {
    let mut values = Vec::new();
    while body.has_remaining() {
        let length = take(body, 4)?;
        let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
        if length < 2 {
            return Err(SyncError::Decode(format!("PDV 长度无效: {length}")));
        }
        let item = take(body, length)?;
        values.push(PDataValue {
            context_id: item[0],
            is_command: item[1] & 0x01 != 0,
            is_last: item[1] & 0x02 != 0,
            data: item[2..].to_vec(),
        });
    }
    Ok(values)
}
