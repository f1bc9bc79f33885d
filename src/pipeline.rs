use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::{Client, multipart};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::PipelineSettings;
use crate::domain::{RequestEncoding, StorageMode};
use crate::error::RelayError;
use crate::metadata::{InstanceOrder, StudyMetadata};
use crate::registry::ExamRecord;
use crate::report::{ReportOutcome, ReportWriter};
use crate::store::{PIPELINE_RESPONSE_FILE, Store};

/// Include terms must all appear, exclude terms must all be absent. Matching ignores
/// case and Portuguese accents.
#[derive(Debug, Clone)]
pub struct DispatchPredicate {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl DispatchPredicate {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let fold = |terms: &[String]| {
            terms
                .iter()
                .map(|term| fold_text(term))
                .filter(|term| !term.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            include: fold(include),
            exclude: fold(exclude),
        }
    }

    pub fn matches(&self, description: &str) -> bool {
        let text = fold_text(description);
        self.include.iter().all(|term| text.contains(term.as_str()))
            && !self.exclude.iter().any(|term| text.contains(term.as_str()))
    }

    pub fn explain(&self, description: &str) -> Option<String> {
        let text = fold_text(description);
        if let Some(term) = self.include.iter().find(|term| !text.contains(term.as_str())) {
            return Some(format!("description lacks `{term}`"));
        }
        self.exclude
            .iter()
            .find(|term| text.contains(term.as_str()))
            .map(|term| format!("description contains `{term}`"))
    }
}

pub fn fold_text(text: &str) -> String {
    text.trim()
        .to_uppercase()
        .chars()
        .map(|ch| match ch {
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'Ñ' => 'N',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub should_dispatch: bool,
    pub encoding: RequestEncoding,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PipelineBody {
    Json(Value),
    Multipart {
        fields: Vec<(String, String)>,
        file_name: String,
        file_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub body: PipelineBody,
}

#[derive(Debug, Clone)]
pub struct PipelineReply {
    pub status: u16,
    pub body: Value,
}

pub trait PipelineTransport: Send + Sync {
    fn send(&self, request: &PipelineRequest) -> Result<PipelineReply, RelayError>;
}

#[derive(Clone)]
pub struct HttpPipelineTransport {
    client: Client,
}

impl HttpPipelineTransport {
    pub fn new() -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("study-relay/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RelayError::Dispatch(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| RelayError::Dispatch(err.to_string()))?;
        Ok(Self { client })
    }
}

impl PipelineTransport for HttpPipelineTransport {
    fn send(&self, request: &PipelineRequest) -> Result<PipelineReply, RelayError> {
        let mut builder = self.client.post(&request.url).timeout(request.timeout);
        if let Some(token) = &request.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder = match &request.body {
            PipelineBody::Json(body) => builder.json(body),
            PipelineBody::Multipart {
                fields,
                file_name,
                file_path,
            } => {
                let bytes = fs::read(file_path)
                    .map_err(|err| RelayError::Dispatch(format!("read {}: {err}", file_path.display())))?;
                let part = multipart::Part::bytes(bytes)
                    .file_name(file_name.clone())
                    .mime_str("application/dicom")
                    .map_err(|err| RelayError::Dispatch(err.to_string()))?;
                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                builder.multipart(form.part("file", part))
            }
        };
        let response = builder
            .send()
            .map_err(|err| RelayError::DispatchUnreachable(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|err| RelayError::DispatchUnreachable(err.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(PipelineReply { status, body })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub status: u16,
    pub body: Value,
    pub trace_path: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    NotApplicable,
    Skipped { reason: String },
    Dispatched {
        status: u16,
        report: Option<ReportOutcome>,
        report_error: Option<String>,
    },
    Failed { error: String },
}

/// Forwards a placed study to the external processing API. Reads only what is already
/// on disk for the study.
pub struct PipelineDispatcher {
    settings: PipelineSettings,
    predicate: DispatchPredicate,
    transport: Arc<dyn PipelineTransport>,
    reporter: Option<ReportWriter>,
}

impl PipelineDispatcher {
    pub fn new(
        settings: PipelineSettings,
        transport: Arc<dyn PipelineTransport>,
        reporter: Option<ReportWriter>,
    ) -> Self {
        let predicate = DispatchPredicate::new(&settings.include_terms, &settings.exclude_terms);
        Self {
            settings,
            predicate,
            transport,
            reporter,
        }
    }

    pub fn strict(&self) -> bool {
        self.settings.strict
    }

    pub fn decide(&self, record: &ExamRecord) -> DispatchDecision {
        let encoding = self.settings.encoding;
        if !self.settings.enabled {
            return DispatchDecision {
                should_dispatch: false,
                encoding,
                reason: Some("pipeline disabled".to_string()),
            };
        }
        let reason = self.predicate.explain(&record.study_description);
        DispatchDecision {
            should_dispatch: reason.is_none(),
            encoding,
            reason,
        }
    }

    /// Predicate, dispatch, then the optional report. `Err` only for dispatch failures;
    /// report failures are carried in the outcome.
    pub fn process(
        &self,
        record: &ExamRecord,
        metadata: &StudyMetadata,
    ) -> Result<DispatchOutcome, RelayError> {
        let decision = self.decide(record);
        if !decision.should_dispatch {
            let reason = decision.reason.unwrap_or_default();
            info!(accession = %record.accession_number, reason = %reason, "dispatch skipped");
            return Ok(DispatchOutcome::Skipped { reason });
        }

        let response = match self.dispatch(record, metadata)? {
            Some(response) => response,
            None => {
                return Ok(DispatchOutcome::Skipped {
                    reason: "patient age unavailable for multipart request".to_string(),
                });
            }
        };

        let (report, report_error) = match &self.reporter {
            Some(reporter) if reporter.enabled() => match reporter.write(
                record.exam_order_id.as_deref(),
                &response.body,
                &record.storage_path,
            ) {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => {
                    warn!(accession = %record.accession_number, error = %err, "report not written");
                    (None, Some(err.to_string()))
                }
            },
            _ => (None, None),
        };

        Ok(DispatchOutcome::Dispatched {
            status: response.status,
            report,
            report_error,
        })
    }

    /// Sends the study and writes `pipeline_response.json`. `Ok(None)` when a multipart
    /// request cannot be built because the age is unknown.
    pub fn dispatch(
        &self,
        record: &ExamRecord,
        metadata: &StudyMetadata,
    ) -> Result<Option<PipelineResponse>, RelayError> {
        let url = self
            .settings
            .api_url
            .clone()
            .ok_or_else(|| RelayError::Dispatch("pipeline.api_url is not configured".to_string()))?;
        let study_dir = &record.storage_path;

        let (body, trace_request) = match self.settings.encoding {
            RequestEncoding::Json => {
                let payload = json_payload(record, metadata, study_dir)?;
                let trace = json!({
                    "url": url,
                    "format": RequestEncoding::Json.to_string(),
                    "an": record.accession_number,
                    "servidor": record.server,
                    "exame": record.study_description,
                    "payload": payload,
                });
                (PipelineBody::Json(payload), trace)
            }
            RequestEncoding::MultipartSingleFile => {
                let Some(age) = record.normalized_age.clone().filter(|age| !age.is_empty()) else {
                    warn!(accession = %record.accession_number, "patient age missing; multipart dispatch skipped");
                    return Ok(None);
                };
                let ranked = ranked_instances(study_dir)?;
                let file_path = select_representative(&ranked)
                    .cloned()
                    .ok_or_else(|| RelayError::Dispatch(format!("no instances under {study_dir}")))?;
                let file_name = file_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "instance.dcm".to_string());
                let fields = vec![
                    ("age".to_string(), age),
                    ("identificador".to_string(), record.accession_number.to_string()),
                ];
                let trace = json!({
                    "url": url,
                    "format": RequestEncoding::MultipartSingleFile.to_string(),
                    "an": record.accession_number,
                    "servidor": record.server,
                    "exame": record.study_description,
                    "file_name": file_name,
                    "fields": fields
                        .iter()
                        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                        .collect::<serde_json::Map<String, Value>>(),
                });
                (
                    PipelineBody::Multipart {
                        fields,
                        file_name,
                        file_path,
                    },
                    trace,
                )
            }
        };

        let request = PipelineRequest {
            url,
            token: self.settings.api_token.clone(),
            timeout: self.settings.timeout,
            body,
        };
        let trace_path = study_dir.join(PIPELINE_RESPONSE_FILE);

        let mut attempt = 0;
        loop {
            let result = self.transport.send(&request).and_then(|reply| {
                Store::write_json(
                    &trace_path,
                    &json!({
                        "request": trace_request,
                        "response": { "status_code": reply.status, "body": reply.body },
                    }),
                )?;
                if (200..300).contains(&reply.status) {
                    Ok(reply)
                } else {
                    Err(RelayError::DispatchStatus {
                        status: reply.status,
                        message: short_body(&reply.body),
                    })
                }
            });
            match result {
                Ok(reply) => {
                    info!(accession = %record.accession_number, status = reply.status, "study dispatched");
                    return Ok(Some(PipelineResponse {
                        status: reply.status,
                        body: reply.body,
                        trace_path,
                    }));
                }
                Err(err) if err.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    warn!(accession = %record.accession_number, attempt, error = %err, "dispatch retry");
                    thread::sleep(Duration::from_secs(u64::from(attempt)));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn json_payload(
    record: &ExamRecord,
    metadata: &StudyMetadata,
    study_dir: &Utf8Path,
) -> Result<Value, RelayError> {
    let mut series_documents = Vec::new();
    if study_dir.as_std_path().exists() {
        for entry in fs::read_dir(study_dir.as_std_path())
            .map_err(|err| RelayError::Dispatch(err.to_string()))?
        {
            let path = entry
                .map_err(|err| RelayError::Dispatch(err.to_string()))?
                .path();
            let is_dump = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("metadata_series_"))
                .unwrap_or(false);
            if is_dump {
                series_documents.push(path.display().to_string());
            }
        }
    }
    series_documents.sort();
    Ok(json!({
        "an": record.accession_number,
        "servidor": record.server,
        "study_uid": metadata.study_instance_uid,
        "patient_name": metadata.patient_name,
        "study_desc": metadata.study_description,
        "modality": metadata.modality,
        "age": metadata.normalized_age,
        "exam_order_id": record.exam_order_id,
        "dicom_dir": study_dir,
        "dicom_metadata_paths": series_documents,
        "storage_mode": StorageMode::Pipeline,
    }))
}

fn short_body(body: &Value) -> String {
    let text = match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    text.chars().take(200).collect()
}

/// Instance files grouped by `series_<n>` directory, in series then instance order.
pub fn series_files(study_dir: &Utf8Path) -> Result<Vec<Vec<PathBuf>>, RelayError> {
    let mut series = Vec::new();
    let entries = fs::read_dir(study_dir.as_std_path())
        .map_err(|err| RelayError::Dispatch(format!("read {study_dir}: {err}")))?;
    for entry in entries {
        let path = entry
            .map_err(|err| RelayError::Dispatch(err.to_string()))?
            .path();
        let Some(index) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("series_"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if !path.is_dir() {
            continue;
        }
        let mut files = Store::list_files(&path)?;
        files.retain(|file| file.extension().map(|ext| ext == "dcm").unwrap_or(false));
        if !files.is_empty() {
            series.push((index, files));
        }
    }
    series.sort_by_key(|(index, _)| *index);
    Ok(series.into_iter().map(|(_, files)| files).collect())
}

/// Every instance of the study, ordered by its header rather than by the archive's listing.
pub fn ranked_instances(study_dir: &Utf8Path) -> Result<Vec<(InstanceOrder, PathBuf)>, RelayError> {
    let mut ranked = series_files(study_dir)?
        .into_iter()
        .flatten()
        .map(|path| (InstanceOrder::read(&path), path))
        .collect::<Vec<_>>();
    ranked.sort();
    Ok(ranked)
}

/// More than one series: first instance of the second. One series: its second instance,
/// or the only one. An instance without a SeriesInstanceUID is a series of its own.
pub fn select_representative(ranked: &[(InstanceOrder, PathBuf)]) -> Option<&PathBuf> {
    let mut series: Vec<&str> = Vec::new();
    for (order, path) in ranked {
        let uid = order.series_uid.as_str();
        if uid.is_empty() || !series.contains(&uid) {
            if !series.is_empty() {
                return Some(path);
            }
            series.push(uid);
        }
    }
    match ranked {
        [] => None,
        [(_, only)] => Some(only),
        [_, (_, second), ..] => Some(second),
    }
}
