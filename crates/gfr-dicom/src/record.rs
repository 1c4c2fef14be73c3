//! 检查记录
//!
//! `ExamRecord` 是固定的字段集合。网络查询结果按严格模式解码，
//! 出现未登记的属性即视为解码失败；磁盘上的文件由前端补充过私有属性，按宽松模式解码。
//! 写盘时字段集合的版本记录在文件头的实现版本名中。

use crate::transfer_syntax::{sop_class_uids, transfer_syntax_uids, trim_uid};
use chrono::NaiveDate;
use dicom::core::header::Header;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, FileMetaTableBuilder, InMemDicomObject};
use gfr_core::utils::{generate_dicom_uid, is_valid_dicom_uid};
use gfr_core::{Result, SyncError};
use std::path::Path;
use tracing::debug;

/// 嵌套序列的最大深度，超过即拒绝
pub const MAX_SEQUENCE_DEPTH: usize = 8;

/// 字段集合版本
pub const SCHEMA_VERSION: u32 = 1;

const VERSION_PREFIX: &str = "GFR_REC_";

const TOP_LEVEL_TAGS: &[Tag] = &[
    tags::SPECIFIC_CHARACTER_SET,
    tags::QUERY_RETRIEVE_LEVEL,
    tags::ACCESSION_NUMBER,
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_DESCRIPTION,
    tags::MODALITY,
    tags::REQUESTED_PROCEDURE_DESCRIPTION,
    tags::RETRIEVE_AE_TITLE,
    tags::INSTANCE_AVAILABILITY,
    tags::SOP_CLASS_UID,
    tags::SOP_INSTANCE_UID,
    tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
];

const STEP_TAGS: &[Tag] = &[
    tags::SCHEDULED_STATION_AE_TITLE,
    tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
    tags::MODALITY,
    tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION,
];

/// 解码模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// 未登记的属性导致解码失败
    Strict,
    /// 忽略未登记的属性
    Lenient,
}

/// 预约的检查步骤
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledStep {
    pub station_ae_title: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub modality: Option<String>,
    pub description: Option<String>,
}

/// 检查记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamRecord {
    pub specific_character_set: Option<String>,
    pub query_retrieve_level: Option<String>,
    pub accession_number: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub patient_sex: Option<String>,
    pub study_instance_uid: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub modality: Option<String>,
    pub requested_procedure_description: Option<String>,
    pub retrieve_ae_title: Option<String>,
    pub instance_availability: Option<String>,
    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub scheduled_steps: Vec<ScheduledStep>,
}

impl ExamRecord {
    /// 从数据集解码
    pub fn from_object(obj: &InMemDicomObject, mode: DecodeMode) -> Result<Self> {
        check_sequence_depth(obj)?;
        if mode == DecodeMode::Strict {
            reject_unknown(obj, TOP_LEVEL_TAGS)?;
        }

        let mut scheduled_steps = Vec::new();
        if let Ok(sequence) = obj.element(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE) {
            for item in sequence.items().unwrap_or_default() {
                if mode == DecodeMode::Strict {
                    reject_unknown(item, STEP_TAGS)?;
                }
                scheduled_steps.push(ScheduledStep {
                    station_ae_title: text(item, tags::SCHEDULED_STATION_AE_TITLE),
                    start_date: date(item, tags::SCHEDULED_PROCEDURE_STEP_START_DATE),
                    modality: text(item, tags::MODALITY),
                    description: text(item, tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION),
                });
            }
        }

        Ok(Self {
            specific_character_set: text(obj, tags::SPECIFIC_CHARACTER_SET),
            query_retrieve_level: text(obj, tags::QUERY_RETRIEVE_LEVEL),
            accession_number: text(obj, tags::ACCESSION_NUMBER),
            patient_id: text(obj, tags::PATIENT_ID),
            patient_name: text(obj, tags::PATIENT_NAME),
            patient_birth_date: date(obj, tags::PATIENT_BIRTH_DATE),
            patient_sex: text(obj, tags::PATIENT_SEX),
            study_instance_uid: uid(obj, tags::STUDY_INSTANCE_UID),
            study_date: date(obj, tags::STUDY_DATE),
            study_time: text(obj, tags::STUDY_TIME),
            study_description: text(obj, tags::STUDY_DESCRIPTION),
            modality: text(obj, tags::MODALITY),
            requested_procedure_description: text(obj, tags::REQUESTED_PROCEDURE_DESCRIPTION),
            retrieve_ae_title: text(obj, tags::RETRIEVE_AE_TITLE),
            instance_availability: text(obj, tags::INSTANCE_AVAILABILITY),
            sop_class_uid: uid(obj, tags::SOP_CLASS_UID),
            sop_instance_uid: uid(obj, tags::SOP_INSTANCE_UID),
            scheduled_steps,
        })
    }

    /// 编码为数据集，只写入有值的字段
    pub fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        let strings = [
            (tags::SPECIFIC_CHARACTER_SET, VR::CS, &self.specific_character_set),
            (tags::QUERY_RETRIEVE_LEVEL, VR::CS, &self.query_retrieve_level),
            (tags::ACCESSION_NUMBER, VR::SH, &self.accession_number),
            (tags::PATIENT_ID, VR::LO, &self.patient_id),
            (tags::PATIENT_NAME, VR::PN, &self.patient_name),
            (tags::PATIENT_SEX, VR::CS, &self.patient_sex),
            (tags::STUDY_INSTANCE_UID, VR::UI, &self.study_instance_uid),
            (tags::STUDY_TIME, VR::TM, &self.study_time),
            (tags::STUDY_DESCRIPTION, VR::LO, &self.study_description),
            (tags::MODALITY, VR::CS, &self.modality),
            (
                tags::REQUESTED_PROCEDURE_DESCRIPTION,
                VR::LO,
                &self.requested_procedure_description,
            ),
            (tags::RETRIEVE_AE_TITLE, VR::AE, &self.retrieve_ae_title),
            (tags::INSTANCE_AVAILABILITY, VR::CS, &self.instance_availability),
            (tags::SOP_CLASS_UID, VR::UI, &self.sop_class_uid),
            (tags::SOP_INSTANCE_UID, VR::UI, &self.sop_instance_uid),
        ];
        for (tag, vr, value) in strings {
            put_text(&mut obj, tag, vr, value.as_deref());
        }
        put_date(&mut obj, tags::PATIENT_BIRTH_DATE, self.patient_birth_date);
        put_date(&mut obj, tags::STUDY_DATE, self.study_date);

        if !self.scheduled_steps.is_empty() {
            let items: Vec<InMemDicomObject> = self
                .scheduled_steps
                .iter()
                .map(|step| {
                    let mut item = InMemDicomObject::new_empty();
                    put_text(
                        &mut item,
                        tags::SCHEDULED_STATION_AE_TITLE,
                        VR::AE,
                        step.station_ae_title.as_deref(),
                    );
                    put_date(&mut item, tags::SCHEDULED_PROCEDURE_STEP_START_DATE, step.start_date);
                    put_text(&mut item, tags::MODALITY, VR::CS, step.modality.as_deref());
                    put_text(
                        &mut item,
                        tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION,
                        VR::LO,
                        step.description.as_deref(),
                    );
                    item
                })
                .collect();
            obj.put(DataElement::new(
                tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(items),
            ));
        }
        obj
    }

    /// 检查号和患者号都存在时返回它们
    pub fn identity(&self) -> Result<(&str, &str)> {
        match (self.accession_number.as_deref(), self.patient_id.as_deref()) {
            (Some(accession), Some(patient)) => Ok((accession, patient)),
            _ => Err(SyncError::Validation(
                "record lacks AccessionNumber or PatientID".into(),
            )),
        }
    }

    /// 检查项目描述，缺省时使用第一个预约步骤的描述
    pub fn procedure(&self) -> Option<&str> {
        self.requested_procedure_description.as_deref().or_else(|| {
            self.scheduled_steps
                .iter()
                .find_map(|step| step.description.as_deref())
        })
    }

    /// 检查日期，缺省时使用第一个预约步骤的开始日期
    pub fn scheduled_date(&self) -> Option<NaiveDate> {
        self.study_date
            .or_else(|| self.scheduled_steps.iter().find_map(|step| step.start_date))
    }
}

/// RIS 预约查询：按预约检查站 AE 过滤，其余字段作为返回键
pub fn ris_worklist_query(calling_ae_title: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    put_text(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, Some("STUDY"));
    for (tag, vr) in [
        (tags::STUDY_DATE, VR::DA),
        (tags::ACCESSION_NUMBER, VR::SH),
        (tags::PATIENT_NAME, VR::PN),
        (tags::PATIENT_ID, VR::LO),
        (tags::PATIENT_BIRTH_DATE, VR::DA),
        (tags::STUDY_INSTANCE_UID, VR::UI),
        (tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO),
    ] {
        put_empty(&mut obj, tag, vr);
    }

    let mut step = InMemDicomObject::new_empty();
    put_empty(&mut step, tags::MODALITY, VR::CS);
    put_text(
        &mut step,
        tags::SCHEDULED_STATION_AE_TITLE,
        VR::AE,
        Some(calling_ae_title),
    );
    put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_START_DATE, VR::DA);
    put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO);
    obj.put(DataElement::new(
        tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(vec![step]),
    ));
    obj
}

/// PACS 历史查询：只按患者号匹配
pub fn history_query(patient_id: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    put_text(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, Some("STUDY"));
    put_text(&mut obj, tags::PATIENT_ID, VR::LO, Some(patient_id));
    for (tag, vr) in [
        (tags::ACCESSION_NUMBER, VR::SH),
        (tags::PATIENT_NAME, VR::PN),
        (tags::STUDY_DATE, VR::DA),
        (tags::STUDY_DESCRIPTION, VR::LO),
        (tags::STUDY_INSTANCE_UID, VR::UI),
    ] {
        put_empty(&mut obj, tag, vr);
    }
    obj
}

/// C-MOVE 标识：优先 StudyInstanceUID，UID 缺失或格式错误时用检查号
pub fn relocate_query(record: &ExamRecord) -> Result<InMemDicomObject> {
    let mut obj = InMemDicomObject::new_empty();
    put_text(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, Some("STUDY"));
    let study_uid = record
        .study_instance_uid
        .as_deref()
        .filter(|uid| is_valid_dicom_uid(uid));
    if let Some(study_uid) = study_uid {
        put_text(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, Some(study_uid));
    } else if let Some(accession) = record.accession_number.as_deref() {
        put_text(&mut obj, tags::ACCESSION_NUMBER, VR::SH, Some(accession));
    } else {
        return Err(SyncError::Validation(
            "relocate identifier needs StudyInstanceUID or AccessionNumber".into(),
        ));
    }
    Ok(obj)
}

/// 将记录写为 Part-10 文件；缺少 SOP 实例 UID 时生成一个
pub fn write_record_file(path: &Path, record: &ExamRecord) -> Result<()> {
    let mut record = record.clone();
    let sop_class = record
        .sop_class_uid
        .get_or_insert_with(|| sop_class_uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string())
        .clone();
    let sop_instance = record
        .sop_instance_uid
        .get_or_insert_with(generate_dicom_uid)
        .clone();
    write_object_file(path, record.to_object(), &sop_class, &sop_instance)
}

/// 按原样把数据集写为 Part-10 文件
pub fn write_object_file(
    path: &Path,
    obj: InMemDicomObject,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> Result<()> {
    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class_uid)
                .media_storage_sop_instance_uid(sop_instance_uid)
                .implementation_version_name(format!("{VERSION_PREFIX}{SCHEMA_VERSION}")),
        )
        .map_err(|e| SyncError::Dicom(format!("无法构建文件头: {e}")))?;
    file.write_to_file(path)
        .map_err(|e| SyncError::Storage(format!("无法写入 {}: {e}", path.display())))?;
    debug!("写入DICOM文件: {}", path.display());
    Ok(())
}

/// 读取 Part-10 文件中的检查记录
pub fn read_record_file(path: &Path) -> Result<ExamRecord> {
    let file = open_file(path)
        .map_err(|e| SyncError::Decode(format!("无法解析 {}: {e}", path.display())))?;
    check_schema_version(file.meta().implementation_version_name.as_deref())?;
    ExamRecord::from_object(&file, DecodeMode::Lenient)
}

/// 其他实现写入的文件不带版本；本程序写入的文件版本不得高于当前版本
fn check_schema_version(version_name: Option<&str>) -> Result<()> {
    let Some(version) = version_name
        .map(|name| name.trim_end_matches(['\0', ' ']))
        .and_then(|name| name.strip_prefix(VERSION_PREFIX))
    else {
        return Ok(());
    };
    match version.parse::<u32>() {
        Ok(v) if v <= SCHEMA_VERSION => Ok(()),
        _ => Err(SyncError::Decode(format!("不支持的记录版本: {version}"))),
    }
}

fn check_sequence_depth(obj: &InMemDicomObject) -> Result<()> {
    let mut pending: Vec<(&InMemDicomObject, usize)> = vec![(obj, 0)];
    while let Some((current, depth)) = pending.pop() {
        for element in current.iter() {
            if let Some(items) = element.items() {
                if depth + 1 > MAX_SEQUENCE_DEPTH {
                    return Err(SyncError::Decode(format!(
                        "序列嵌套超过 {MAX_SEQUENCE_DEPTH} 层: {}",
                        element.tag()
                    )));
                }
                pending.extend(items.iter().map(|item| (item, depth + 1)));
            }
        }
    }
    Ok(())
}

fn reject_unknown(obj: &InMemDicomObject, known: &[Tag]) -> Result<()> {
    for element in obj.iter() {
        let tag = element.tag();
        // 组长度不携带内容
        if tag.element() == 0x0000 {
            continue;
        }
        if !known.contains(&tag) {
            return Err(SyncError::Decode(format!("未登记的属性: {tag}")));
        }
    }
    Ok(())
}

fn text(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn uid(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    text(obj, tag)
        .map(|s| trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

fn date(obj: &InMemDicomObject, tag: Tag) -> Option<NaiveDate> {
    let raw = text(obj, tag)?;
    match NaiveDate::parse_from_str(&raw, "%Y%m%d") {
        Ok(date) => Some(date),
        Err(_) => {
            debug!("无法解析日期 {} = {:?}", tag, raw);
            None
        }
    }
}

fn put_text(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: Option<&str>) {
    if let Some(value) = value {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
}

fn put_date(obj: &mut InMemDicomObject, tag: Tag, value: Option<NaiveDate>) {
    if let Some(value) = value {
        obj.put(DataElement::new(
            tag,
            VR::DA,
            PrimitiveValue::from(value.format("%Y%m%d").to_string()),
        ));
    }
}

fn put_empty(obj: &mut InMemDicomObject, tag: Tag, vr: VR) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
}
