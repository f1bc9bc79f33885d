#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use serde_json::Value;
use tempfile::TempDir;

use study_relay::config::PipelineSettings;
use study_relay::domain::{AccessionNumber, RequestEncoding, StorageMode};
use study_relay::error::RelayError;
use study_relay::metadata::MetadataExtractor;
use study_relay::orchestrator::Relay;
use study_relay::pipeline::{PipelineDispatcher, PipelineReply, PipelineRequest, PipelineTransport};
use study_relay::registry::ExamRegistry;
use study_relay::retention::RetentionManager;
use study_relay::retrieval::{DownloadEngine, RetryPolicy};
use study_relay::router::StorageRouter;
use study_relay::session::{AuthProvider, SessionHandle, SessionToken, StaticAuth};
use study_relay::store::Store;
use study_relay::wado::{ArchiveServer, ArchiveTransport, InstanceRef, SeriesLayout, StudyLayout};

#[derive(Debug, Clone)]
pub struct FakeStudy {
    pub accession: String,
    pub patient_name: String,
    pub description: String,
    pub age: Option<String>,
    /// SOP instance UIDs per series.
    pub series: Vec<Vec<String>>,
    /// SeriesNumber written into each series' instances.
    pub series_numbers: Vec<u32>,
}

impl FakeStudy {
    pub fn new(accession: &str, description: &str, series: &[usize]) -> Self {
        Self {
            accession: accession.to_string(),
            patient_name: "DOE^JANE".to_string(),
            description: description.to_string(),
            age: Some("067Y".to_string()),
            series: series
                .iter()
                .enumerate()
                .map(|(s, count)| {
                    (0..*count)
                        .map(|i| format!("1.2.840.99.{accession}.{}.{}", s + 1, i + 1))
                        .collect()
                })
                .collect(),
            series_numbers: (1..=series.len() as u32).collect(),
        }
    }

    /// Same study, but the headers number the series in the given order.
    pub fn numbered(mut self, series_numbers: &[u32]) -> Self {
        self.series_numbers = series_numbers.to_vec();
        self
    }

    pub fn study_uid(&self) -> String {
        format!("1.2.840.99.{}", self.accession)
    }

    pub fn series_uid(&self, index: usize) -> String {
        format!("1.2.840.99.{}.{}", self.accession, index + 1)
    }

    pub fn layout(&self) -> StudyLayout {
        StudyLayout {
            study_uid: self.study_uid(),
            series: self
                .series
                .iter()
                .enumerate()
                .map(|(index, instances)| SeriesLayout {
                    series_uid: self.series_uid(index),
                    instances: instances.clone(),
                })
                .collect(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.series.iter().map(Vec::len).sum()
    }
}

/// Writes a minimal Part-10 file carrying the tags the relay routes on.
pub fn write_instance(study: &FakeStudy, instance: &InstanceRef, destination: &Path) -> u64 {
    let mut elements = vec![
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(study.patient_name.as_str())),
        DataElement::new(tags::ACCESSION_NUMBER, VR::SH, PrimitiveValue::from(study.accession.as_str())),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CR")),
        DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, PrimitiveValue::from(study.description.as_str())),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study.study_uid().as_str())),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(instance.series_uid.as_str())),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(instance.sop_uid.as_str())),
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE)),
    ];
    let series_number = study.series_numbers[instance.series_index].to_string();
    let instance_number = (instance.instance_index + 1).to_string();
    elements.push(DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from(series_number.as_str())));
    elements.push(DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance_number.as_str())));
    if let Some(age) = &study.age {
        elements.push(DataElement::new(tags::PATIENT_AGE, VR::AS, PrimitiveValue::from(age.as_str())));
    }
    let object = InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(instance.sop_uid.as_str())
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
        )
        .unwrap();
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    object.write_to_file(destination).unwrap();
    fs::metadata(destination).unwrap().len()
}

/// In-memory archive federation. Servers listed as down answer every call with a
/// network error; servers listed as empty do not know any study.
#[derive(Default)]
pub struct FakeArchive {
    studies: HashMap<String, FakeStudy>,
    down: HashSet<String>,
    empty: HashSet<String>,
    /// Servers that reject the first N requests with 401.
    expired: Mutex<HashMap<String, usize>>,
    /// Requests each token is honoured for before it answers 401.
    token_lifetime: Option<usize>,
    token_uses: Mutex<HashMap<String, usize>>,
    /// SOP instance UIDs every server answers with 500.
    broken: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
    pub delivered: Mutex<Vec<String>>,
}

impl FakeArchive {
    pub fn new(studies: Vec<FakeStudy>) -> Self {
        Self {
            studies: studies
                .into_iter()
                .map(|study| (study.accession.clone(), study))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_down(mut self, server: &str) -> Self {
        self.down.insert(server.to_string());
        self
    }

    pub fn with_empty(mut self, server: &str) -> Self {
        self.empty.insert(server.to_string());
        self
    }

    pub fn with_expired_session(self, server: &str, rejections: usize) -> Self {
        if let Ok(mut expired) = self.expired.lock() {
            expired.insert(server.to_string(), rejections);
        }
        self
    }

    pub fn with_token_lifetime(mut self, requests: usize) -> Self {
        self.token_lifetime = Some(requests);
        self
    }

    pub fn with_broken_instance(mut self, sop_uid: &str) -> Self {
        self.broken.insert(sop_uid.to_string());
        self
    }

    fn gate(&self, server: &ArchiveServer, token: &SessionToken, call: String) -> Result<(), RelayError> {
        self.calls.lock().unwrap().push(call);
        let name = server.name.to_string();
        if self.down.contains(&name) {
            return Err(RelayError::ServerUnavailable {
                server: name,
                message: "connection refused".to_string(),
            });
        }
        let mut expired = self.expired.lock().unwrap();
        if let Some(remaining) = expired.get_mut(&name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(RelayError::AuthExpired { server: name });
        }
        if let Some(lifetime) = self.token_lifetime {
            let key = token.authorization.clone().unwrap_or_default();
            let mut uses = self.token_uses.lock().unwrap();
            let used = uses.entry(key).or_insert(0);
            if *used >= lifetime {
                return Err(RelayError::AuthExpired { server: name });
            }
            *used += 1;
        }
        Ok(())
    }
}

impl ArchiveTransport for FakeArchive {
    fn query_study(
        &self,
        server: &ArchiveServer,
        accession: &AccessionNumber,
        token: &SessionToken,
    ) -> Result<StudyLayout, RelayError> {
        self.gate(server, token, format!("query {} {}", server.name, accession))?;
        match self.studies.get(accession.query_key()) {
            Some(study) if !self.empty.contains(server.name.as_str()) => Ok(study.layout()),
            _ => Err(RelayError::StudyNotFound {
                accession: accession.to_string(),
                message: "no study".to_string(),
            }),
        }
    }

    fn fetch_instance(
        &self,
        server: &ArchiveServer,
        study_uid: &str,
        instance: &InstanceRef,
        destination: &Path,
        token: &SessionToken,
    ) -> Result<u64, RelayError> {
        self.gate(server, token, format!("fetch {} {}", server.name, instance.sop_uid))?;
        if self.broken.contains(&instance.sop_uid) {
            return Err(RelayError::ArchiveStatus {
                server: server.name.to_string(),
                status: 500,
                message: "instance unreadable".to_string(),
            });
        }
        let study = self
            .studies
            .values()
            .find(|study| study.study_uid() == study_uid)
            .ok_or_else(|| RelayError::ArchiveStatus {
                server: server.name.to_string(),
                status: 404,
                message: "unknown study".to_string(),
            })?;
        let size = write_instance(study, instance, destination);
        self.delivered.lock().unwrap().push(instance.sop_uid.clone());
        Ok(size)
    }
}

/// Counts refreshes and numbers every token it issues. Clones share the counter.
#[derive(Clone, Default)]
pub struct CountingAuth {
    pub refreshes: Arc<Mutex<usize>>,
}

fn numbered_token(n: usize) -> SessionToken {
    SessionToken {
        authorization: Some(format!("Bearer session-{n}")),
        ..SessionToken::anonymous()
    }
}

impl CountingAuth {
    pub fn refresh_count(&self) -> usize {
        *self.refreshes.lock().unwrap()
    }
}

impl AuthProvider for CountingAuth {
    fn acquire(&self) -> Result<SessionToken, RelayError> {
        Ok(numbered_token(0))
    }

    fn refresh(&self) -> Result<SessionToken, RelayError> {
        let mut refreshes = self.refreshes.lock().unwrap();
        *refreshes += 1;
        Ok(numbered_token(*refreshes))
    }
}

/// Answers every dispatch with a canned report and keeps the requests.
#[derive(Default)]
pub struct RecordingPipeline {
    pub requests: Mutex<Vec<PipelineRequest>>,
    pub status: u16,
}

impl RecordingPipeline {
    pub fn ok() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            status: 200,
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            status,
        }
    }
}

impl PipelineTransport for RecordingPipeline {
    fn send(&self, request: &PipelineRequest) -> Result<PipelineReply, RelayError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PipelineReply {
            status: self.status,
            body: serde_json::json!({"report": "Campos pulmonares livres."}),
        })
    }
}

pub fn servers() -> Vec<ArchiveServer> {
    vec![
        ArchiveServer::new("HAC".parse().unwrap(), "http://hac.local:1000/WADO/AETILE"),
        ArchiveServer::new("HBR".parse().unwrap(), "http://hbr.local:1000/WADO/AETILE"),
    ]
}

pub fn pipeline_settings(encoding: RequestEncoding) -> PipelineSettings {
    PipelineSettings {
        enabled: true,
        api_url: Some("https://pipeline.local/v1/analyze".to_string()),
        api_token: Some("secret".to_string()),
        timeout: Duration::from_secs(5),
        retries: 0,
        strict: false,
        encoding,
        include_terms: vec!["TORAX".to_string()],
        exclude_terms: vec!["PERFIL".to_string()],
    }
}

/// Scratch workspace with a store, registry and retention manager.
pub struct Workspace {
    pub tmp: TempDir,
    pub root: Utf8PathBuf,
    pub registry: Arc<ExamRegistry>,
    pub retention: Arc<RetentionManager>,
    pub session: Arc<SessionHandle>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_auth(Box::new(StaticAuth::default()))
    }

    pub fn with_auth(auth: Box<dyn AuthProvider>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(&root);
        store.ensure_layout().unwrap();
        let registry = Arc::new(ExamRegistry::open(store).unwrap());
        let retention = Arc::new(RetentionManager::new(Arc::clone(&registry)));
        let session = Arc::new(SessionHandle::new(auth));
        Self {
            tmp,
            root,
            registry,
            retention,
            session,
        }
    }

    pub fn store(&self) -> &Store {
        self.registry.store()
    }

    pub fn staging_root(&self) -> &Utf8Path {
        self.store().staging_root()
    }

    pub fn engine<T: ArchiveTransport>(&self, transport: T) -> DownloadEngine<T> {
        self.engine_with_workers(transport, 4)
    }

    pub fn engine_with_workers<T: ArchiveTransport>(&self, transport: T, workers: usize) -> DownloadEngine<T> {
        DownloadEngine::new(
            transport,
            Arc::clone(&self.session),
            Arc::clone(&self.registry),
            RetryPolicy {
                max_retries: 1,
                retry_wait: Duration::ZERO,
            },
            workers,
        )
    }

    pub fn router(&self, mode: StorageMode, max_retained: usize) -> StorageRouter {
        StorageRouter::new(
            mode,
            Arc::clone(&self.registry),
            MetadataExtractor::new(mode == StorageMode::Pipeline),
            Arc::clone(&self.retention),
            max_retained,
        )
    }

    pub fn pipeline_router(
        &self,
        max_retained: usize,
        settings: PipelineSettings,
        transport: Arc<dyn PipelineTransport>,
    ) -> StorageRouter {
        self.router(StorageMode::Pipeline, max_retained)
            .with_dispatcher(PipelineDispatcher::new(settings, transport, None))
    }

    pub fn relay<T: ArchiveTransport>(&self, transport: T, router: StorageRouter) -> Relay<T> {
        Relay::new(self.engine(transport), router, servers())
    }
}

pub fn accession(raw: &str) -> AccessionNumber {
    raw.parse().unwrap()
}

pub fn read_json(path: &Utf8Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap()
}

pub fn files_under(path: &Utf8Path) -> Vec<std::path::PathBuf> {
    if !path.as_std_path().exists() {
        return Vec::new();
    }
    Store::list_files(path.as_std_path()).unwrap()
}
