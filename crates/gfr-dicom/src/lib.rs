//! # DICOM网络模块
//!
//! 上层协议编解码、DIMSE命令集、关联客户端、检查记录字段集以及入站存储监听器。

pub mod association;
pub mod dimse;
pub mod pdu;
pub mod record;
pub mod server;
pub mod services;
pub mod status;
pub mod transfer_syntax;

pub use association::{
    connect, Association, AssociationTimeouts, Connector, DimseResponse, DimseSession,
    NetworkConnector, Responses,
};
pub use record::{DecodeMode, ExamRecord, ScheduledStep};
pub use server::{ListenerConfig, ListenerService, StorageListener};
pub use services::{InboundHandler, LandingStore};
pub use status::{classify, DimseStatus, TransmitStatus};
pub use transfer_syntax::{ServiceContext, TransferSyntaxManager};
