use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{AccessionNumber, ServerName, StorageMode};
use crate::error::RelayError;
use crate::metadata::{MetadataExtractor, StudyMetadata};
use crate::pipeline::{DispatchOutcome, PipelineDispatcher};
use crate::registry::{ExamRecord, ExamRegistry, RecordStatus};
use crate::retention::RetentionManager;
use crate::retrieval::StagingArtifact;
use crate::store::{METADATA_FILE, Store};
use crate::viewer::ViewerHandoff;

#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    #[serde(skip)]
    pub accession: AccessionNumber,
    pub mode: StorageMode,
    pub storage_path: Utf8PathBuf,
    pub server: ServerName,
    pub instance_count: usize,
    pub via_secondary: bool,
    pub dispatch: DispatchOutcome,
    pub evicted: Vec<AccessionNumber>,
    pub viewer_notified: bool,
}

/// Post-download placement. The mode is fixed for the lifetime of the router.
pub struct StorageRouter {
    mode: StorageMode,
    registry: Arc<ExamRegistry>,
    extractor: MetadataExtractor,
    retention: Arc<RetentionManager>,
    max_retained: usize,
    dispatcher: Option<PipelineDispatcher>,
    viewer: Option<ViewerHandoff>,
}

impl StorageRouter {
    pub fn new(
        mode: StorageMode,
        registry: Arc<ExamRegistry>,
        extractor: MetadataExtractor,
        retention: Arc<RetentionManager>,
        max_retained: usize,
    ) -> Self {
        Self {
            mode,
            registry,
            extractor,
            retention,
            max_retained,
            dispatcher: None,
            viewer: None,
        }
    }

    /// Only consulted in pipeline mode.
    pub fn with_dispatcher(mut self, dispatcher: PipelineDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_viewer(mut self, viewer: ViewerHandoff) -> Self {
        self.viewer = Some(viewer);
        self
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn route(&self, artifact: StagingArtifact) -> Result<RouteOutcome, RelayError> {
        match self.mode {
            StorageMode::Persistent | StorageMode::Pipeline => self.place_retained(artifact),
            StorageMode::Transient => self.place_transient(artifact),
        }
    }

    fn place_retained(&self, artifact: StagingArtifact) -> Result<RouteOutcome, RelayError> {
        let accession = artifact.accession().clone();
        let staging = utf8(artifact.dir())?;
        let metadata = self.extractor.extract(&artifact);
        self.extractor.dump_series(&artifact, &staging)?;
        MetadataExtractor::write_document(&staging, &metadata)?;

        let destination = self.registry.store().study_dir(&accession);
        Store::move_dir(artifact.dir(), destination.as_std_path())?;
        let record = self.record_for(&artifact, &metadata, destination.clone());
        self.registry.upsert(record.clone())?;
        info!(accession = %accession, path = %destination, mode = %self.mode, "study placed");

        // Dispatch, retries included, runs on this study worker and its result is part of the
        // study's outcome. Other study workers keep retrieving meanwhile.
        let mut dispatch = DispatchOutcome::NotApplicable;
        let mut dispatch_error = None;
        if self.mode == StorageMode::Pipeline {
            match &self.dispatcher {
                Some(dispatcher) => match dispatcher.process(&record, &metadata) {
                    Ok(outcome) => {
                        if let DispatchOutcome::Dispatched {
                            report_error: Some(_),
                            ..
                        } = &outcome
                        {
                            self.registry
                                .set_status(&accession, RecordStatus::ReportError)?;
                        }
                        dispatch = outcome;
                    }
                    Err(err) => {
                        warn!(accession = %accession, error = %err, strict = dispatcher.strict(), "dispatch failed");
                        self.registry
                            .set_status(&accession, RecordStatus::PipelineError)?;
                        dispatch = DispatchOutcome::Failed {
                            error: err.to_string(),
                        };
                        if dispatcher.strict() {
                            dispatch_error = Some(err);
                        }
                    }
                },
                None => {
                    dispatch = DispatchOutcome::Skipped {
                        reason: "pipeline disabled".to_string(),
                    };
                }
            }
        }

        let viewer_notified = self.notify_viewer(&accession, &destination);

        let evicted = match self.retention.enforce(self.max_retained) {
            Ok(report) => report.evicted,
            Err(err) => {
                warn!(error = %err, "retention cycle skipped");
                Vec::new()
            }
        };

        if let Some(err) = dispatch_error {
            return Err(err);
        }

        Ok(RouteOutcome {
            accession,
            mode: self.mode,
            storage_path: destination,
            server: record.server,
            instance_count: record.instance_count,
            via_secondary: artifact.retrieved_via_secondary(),
            dispatch,
            evicted,
            viewer_notified,
        })
    }

    fn place_transient(&self, artifact: StagingArtifact) -> Result<RouteOutcome, RelayError> {
        let accession = artifact.accession().clone();
        let incoming = self
            .registry
            .store()
            .incoming_dir()
            .map(Utf8Path::to_path_buf)
            .ok_or_else(|| {
                RelayError::InvalidConfig("transient storage requires paths.incoming_dir".to_string())
            })?;
        let metadata = self.extractor.extract(&artifact);

        for instance in &artifact.instances {
            let target = incoming.join(format!("{}.dcm", instance.sop_uid));
            Store::move_file(&instance.path, target.as_std_path())?;
        }

        let record = self.record_for(&artifact, &metadata, incoming.clone());
        self.registry.upsert(record.clone())?;
        let via_secondary = artifact.retrieved_via_secondary();
        let staging = artifact.dir().to_path_buf();
        drop(artifact);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }

        info!(accession = %accession, incoming = %incoming, instances = record.instance_count, "study handed to viewer inbox");

        let viewer_notified = self.notify_viewer(&accession, &incoming);
        if let Err(err) = self.retention.trim_history(self.max_retained) {
            warn!(error = %err, "history trim skipped");
        }

        Ok(RouteOutcome {
            accession,
            mode: self.mode,
            storage_path: incoming,
            server: record.server,
            instance_count: record.instance_count,
            via_secondary,
            dispatch: DispatchOutcome::NotApplicable,
            evicted: Vec::new(),
            viewer_notified,
        })
    }

    /// Re-runs dispatch for a study that is already retained.
    pub fn redispatch(&self, accession: &AccessionNumber) -> Result<DispatchOutcome, RelayError> {
        let dispatcher = self.dispatcher.as_ref().ok_or_else(|| {
            RelayError::InvalidConfig("pipeline dispatch is not active".to_string())
        })?;
        let record = self
            .registry
            .get(accession)?
            .filter(ExamRecord::retains_files)
            .ok_or_else(|| RelayError::Dispatch(format!("{accession} is not retained locally")))?;
        let _pin = self.registry.pin(accession)?;
        let path = record.storage_path.join(METADATA_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| RelayError::MetadataMissing(format!("{path}: {err}")))?;
        let metadata: StudyMetadata = serde_json::from_str(&content)
            .map_err(|err| RelayError::MetadataMissing(format!("{path}: {err}")))?;
        match dispatcher.process(&record, &metadata) {
            Ok(outcome) => {
                let status = match &outcome {
                    DispatchOutcome::Dispatched {
                        report_error: Some(_),
                        ..
                    } => RecordStatus::ReportError,
                    _ => RecordStatus::Complete,
                };
                self.registry.set_status(accession, status)?;
                Ok(outcome)
            }
            Err(err) => {
                self.registry
                    .set_status(accession, RecordStatus::PipelineError)?;
                Err(err)
            }
        }
    }

    fn record_for(
        &self,
        artifact: &StagingArtifact,
        metadata: &StudyMetadata,
        storage_path: Utf8PathBuf,
    ) -> ExamRecord {
        ExamRecord {
            accession_number: artifact.accession().clone(),
            patient_name: metadata.patient_name.clone(),
            modality: metadata.modality.clone(),
            study_description: metadata.study_description.clone(),
            normalized_age: metadata.normalized_age.clone(),
            storage_path,
            downloaded_at: Utc::now(),
            storage_mode: self.mode,
            status: RecordStatus::Complete,
            server: artifact.primary_server.clone(),
            exam_order_id: artifact.reference.exam_order_id.clone(),
            instance_count: artifact.instances.len(),
        }
    }

    fn notify_viewer(&self, accession: &AccessionNumber, placed_at: &Utf8Path) -> bool {
        let Some(viewer) = &self.viewer else {
            return false;
        };
        match viewer.after_placement(accession, placed_at) {
            Ok(request) => request.is_some(),
            Err(err) => {
                warn!(accession = %accession, error = %err, "viewer handoff failed");
                false
            }
        }
    }
}

fn utf8(path: &std::path::Path) -> Result<Utf8PathBuf, RelayError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|path| RelayError::Filesystem(format!("non UTF-8 path: {}", path.display())))
}
