//! 测试用的脚本化关联

use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use gfr_core::{ConnectionError, Department, Hospital, RemoteNode, Result, SyncError};
use gfr_dicom::record::write_record_file;
use gfr_dicom::{Connector, DimseResponse, DimseSession, DimseStatus, ExamRecord, ServiceContext};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const RIS_AE: &str = "RIS";
pub const PACS_AE: &str = "PACS";

/// 远端行为脚本
#[derive(Debug, Default)]
pub struct Script {
    /// 按远端 AE 标题返回的查询结果
    pub records: HashMap<String, Vec<ExamRecord>>,
    /// 拒绝连接的 `AE/操作`
    pub refused: HashSet<String>,
    /// 迁移失败的检查号
    pub relocate_failures: HashSet<String>,
    /// 迁移成功但没有发出任何对象的检查号
    pub relocate_empty: HashSet<String>,
    /// 查询结果中夹带一个无法解码的数据集的远端 AE
    pub undecodable: HashSet<String>,
    /// 迁移成功时对象落地的目录；为空表示对象永远不会到达
    pub landing: Option<PathBuf>,
}

impl Script {
    pub fn refuse(&mut self, ae_title: &str, context: &ServiceContext) {
        self.refused.insert(key(ae_title, context));
    }
}

#[derive(Debug, Default, Clone)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    script: Arc<Script>,
    pub log: CallLog,
}

impl FakeConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            log: CallLog::default(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        local_ae: &str,
        node: &RemoteNode,
        context: ServiceContext,
    ) -> std::result::Result<Box<dyn DimseSession>, ConnectionError> {
        self.log
            .push(format!("connect {} {:?} as {}", node.ae_title, context, local_ae));
        if self.script.refused.contains(&key(&node.ae_title, &context)) {
            return Err(ConnectionError::ConnectionRefused(node.to_string()));
        }
        Ok(Box::new(FakeSession {
            remote: node.ae_title.clone(),
            script: self.script.clone(),
            log: self.log.clone(),
            queue: VecDeque::new(),
        }))
    }
}

pub fn new_session(connector: &FakeConnector, remote: &str) -> FakeSession {
    FakeSession {
        remote: remote.to_string(),
        script: connector.script.clone(),
        log: connector.log.clone(),
        queue: VecDeque::new(),
    }
}

pub struct FakeSession {
    remote: String,
    script: Arc<Script>,
    log: CallLog,
    queue: VecDeque<Result<DimseResponse>>,
}

impl FakeSession {
    fn records(&self) -> &[ExamRecord] {
        self.script
            .records
            .get(&self.remote)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[async_trait]
impl DimseSession for FakeSession {
    async fn begin_find(&mut self, query: &InMemDicomObject) -> Result<()> {
        self.log.push(format!("find {}", self.remote));
        let patient = text(query, tags::PATIENT_ID);
        let mut matches: Vec<_> = self
            .records()
            .iter()
            .filter(|r| patient.is_none() || r.patient_id == patient)
            .map(|r| pending(Some(r.to_object())))
            .collect();
        if self.script.undecodable.contains(&self.remote) {
            let at = matches.len().min(1);
            matches.insert(at, Err(SyncError::Decode("truncated dataset".into())));
        }
        self.queue.extend(matches);
        self.queue.push_back(Ok(done()));
        Ok(())
    }

    async fn begin_relocate(
        &mut self,
        destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<()> {
        let study = text(identifier, tags::STUDY_INSTANCE_UID);
        let accession = text(identifier, tags::ACCESSION_NUMBER);
        let record = self
            .records()
            .iter()
            .find(|r| {
                (study.is_some() && r.study_instance_uid == study)
                    || (accession.is_some() && r.accession_number == accession)
            })
            .cloned();
        let Some(record) = record else {
            return Err(SyncError::NotFound("no such study".into()));
        };
        let acc = record.accession_number.clone().unwrap_or_default();
        self.log
            .push(format!("relocate {} {} -> {}", self.remote, acc, destination));

        if self.script.relocate_failures.contains(&acc) {
            self.queue.push_back(Err(SyncError::ProtocolStatus {
                operation: "C-MOVE".into(),
                status: 0xA801,
            }));
            return Ok(());
        }
        if self.script.relocate_empty.contains(&acc) {
            self.queue.push_back(Ok(DimseResponse {
                completed: Some(0),
                ..done()
            }));
            return Ok(());
        }
        if let Some(landing) = &self.script.landing {
            std::fs::create_dir_all(landing)?;
            write_record_file(&landing.join(format!("{acc}.dcm")), &record)?;
        }
        self.queue.push_back(Ok(DimseResponse {
            completed: Some(1),
            ..done()
        }));
        Ok(())
    }

    async fn next_response(&mut self) -> Option<Result<DimseResponse>> {
        self.queue.pop_front()
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.log.push(format!("release {}", self.remote));
        Ok(())
    }
}

fn key(ae_title: &str, context: &ServiceContext) -> String {
    format!("{ae_title}/{context:?}")
}

fn text(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn pending(identifier: Option<InMemDicomObject>) -> Result<DimseResponse> {
    Ok(DimseResponse {
        status: DimseStatus::Pending,
        code: 0xFF00,
        identifier,
        remaining: None,
        completed: None,
        failed: None,
    })
}

fn done() -> DimseResponse {
    DimseResponse {
        status: DimseStatus::Success,
        code: 0,
        identifier: None,
        remaining: None,
        completed: None,
        failed: None,
    }
}

pub fn booking(accession: &str, patient: &str, procedure: &str) -> ExamRecord {
    ExamRecord {
        accession_number: Some(accession.into()),
        patient_id: Some(patient.into()),
        requested_procedure_description: Some(procedure.into()),
        ..Default::default()
    }
}

pub fn historic(accession: &str, patient: &str, study_uid: &str) -> ExamRecord {
    ExamRecord {
        accession_number: Some(accession.into()),
        patient_id: Some(patient.into()),
        study_instance_uid: Some(study_uid.into()),
        ..Default::default()
    }
}

pub fn department(name: &str, accepted: &[&str]) -> Department {
    Department {
        name: name.into(),
        hospital: Some(Hospital {
            short_name: "RH".into(),
            name: "Rigshospitalet".into(),
        }),
        ris: Some(RemoteNode {
            ae_title: RIS_AE.into(),
            host: "127.0.0.1".into(),
            port: 104,
        }),
        pacs: Some(RemoteNode {
            ae_title: PACS_AE.into(),
            host: "127.0.0.1".into(),
            port: 104,
        }),
        ris_calling: Some("RH_EDTA".into()),
        accepted_procedures: accepted.iter().map(|s| s.to_string()).collect(),
        fetch_history: true,
        ..Default::default()
    }
}
