use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{ScenarioSpec, WorklistSettings};
use crate::domain::{AccessionNumber, ServerName, StudyReference};
use crate::error::RelayError;
use crate::session::{SessionHandle, SessionToken};
use crate::wado::apply_session;

const WORKLIST_PATH: &str = "/ris/laudo/api/v1/worklist/listar";
const ROLLING_PERIOD: &str = "ontemhoje";

/// A named worklist filter, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub payload: Value,
}

impl Scenario {
    pub fn load(spec: &ScenarioSpec) -> Result<Self, RelayError> {
        let content = fs::read_to_string(spec.payload_path.as_std_path()).map_err(|err| {
            RelayError::InvalidConfig(format!(
                "scenario {} payload {}: {err}",
                spec.name, spec.payload_path
            ))
        })?;
        let payload = serde_json::from_str(&content).map_err(|err| {
            RelayError::InvalidConfig(format!("scenario {} payload is not JSON: {err}", spec.name))
        })?;
        Ok(Self {
            name: spec.name.clone(),
            payload,
        })
    }

    pub fn load_all(specs: &[ScenarioSpec]) -> Result<Vec<Self>, RelayError> {
        specs.iter().map(Self::load).collect()
    }

    /// The payload as sent. A rolling "yesterday and today" period gets concrete bounds.
    pub fn payload_at(&self, now: DateTime<Local>) -> Value {
        let mut payload = self.payload.clone();
        let rolling = payload
            .pointer("/nm_periodo_imagem/value")
            .and_then(Value::as_str)
            == Some(ROLLING_PERIOD);
        if !rolling {
            return payload;
        }
        let yesterday = now - ChronoDuration::days(1);
        if let Some(Value::Object(range)) = payload.get_mut("dt_imagem") {
            range.insert(
                "dt_inicio".to_string(),
                Value::String(yesterday.format("%Y-%m-%dT00:00:00.000Z").to_string()),
            );
            range.insert(
                "dt_fim".to_string(),
                Value::String(now.format("%Y-%m-%dT23:59:59.000Z").to_string()),
            );
        }
        payload
    }
}

pub trait StudyLocator: Send + Sync {
    /// Candidate studies for one pass of the loop, without duplicates.
    fn locate(&self) -> Result<Vec<StudyReference>, RelayError>;
}

/// A fixed list, for manual fetches and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    references: Vec<StudyReference>,
}

impl StaticLocator {
    pub fn new(references: Vec<StudyReference>) -> Self {
        Self { references }
    }
}

impl StudyLocator for StaticLocator {
    fn locate(&self) -> Result<Vec<StudyReference>, RelayError> {
        Ok(dedup_references(self.references.clone()))
    }
}

/// Transport for one worklist page. `Ok(None)` means the page could not be read and
/// pagination stops there.
pub trait WorklistTransport: Send + Sync {
    fn page(
        &self,
        url: &str,
        payload: &Value,
        token: &SessionToken,
    ) -> Result<Option<Vec<Value>>, RelayError>;
}

#[derive(Clone)]
pub struct HttpWorklistTransport {
    client: Client,
}

impl HttpWorklistTransport {
    pub fn new() -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("study-relay/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RelayError::Locator(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| RelayError::Locator(err.to_string()))?;
        Ok(Self { client })
    }
}

impl WorklistTransport for HttpWorklistTransport {
    fn page(
        &self,
        url: &str,
        payload: &Value,
        token: &SessionToken,
    ) -> Result<Option<Vec<Value>>, RelayError> {
        let response = match apply_session(self.client.post(url), token).json(payload).send() {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "worklist page unreachable");
                return Ok(None);
            }
        };
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RelayError::AuthExpired {
                server: "worklist".to_string(),
            });
        }
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "worklist page rejected");
            return Ok(None);
        }
        match response.json::<Value>() {
            Ok(Value::Array(rows)) => Ok(Some(rows)),
            Ok(_) => {
                warn!(url, "worklist page is not a list");
                Ok(Some(Vec::new()))
            }
            Err(err) => {
                warn!(url, error = %err, "worklist page is not JSON");
                Ok(Some(Vec::new()))
            }
        }
    }
}

/// Pages through the RIS worklist for every configured scenario.
pub struct WorklistHttpLocator<W: WorklistTransport> {
    transport: W,
    session: Arc<SessionHandle>,
    base_url: String,
    page_size: usize,
    unit_servers: BTreeMap<String, ServerName>,
    scenarios: Vec<Scenario>,
}

impl<W: WorklistTransport> WorklistHttpLocator<W> {
    pub fn new(
        transport: W,
        session: Arc<SessionHandle>,
        settings: &WorklistSettings,
        scenarios: Vec<Scenario>,
    ) -> Result<Self, RelayError> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| RelayError::InvalidConfig("worklist.base_url is not set".to_string()))?;
        Ok(Self {
            transport,
            session,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: settings.page_size.max(1),
            unit_servers: settings.unit_servers.clone(),
            scenarios,
        })
    }

    fn fetch_page(&self, page: usize, payload: &Value) -> Result<Option<Vec<Value>>, RelayError> {
        let url = format!("{}{WORKLIST_PATH}/{page}/{}", self.base_url, self.page_size);
        let lease = self.session.lease()?;
        match self.transport.page(&url, payload, &lease.token) {
            Err(err) if err.is_auth_expired() => {
                warn!("worklist session expired; refreshing");
                let lease = self.session.refresh(lease.generation)?;
                self.transport.page(&url, payload, &lease.token)
            }
            other => other,
        }
    }

    fn scenario_references(&self, scenario: &Scenario) -> Result<Vec<StudyReference>, RelayError> {
        let payload = scenario.payload_at(Local::now());
        let mut references = Vec::new();
        let Some(first) = self.fetch_page(1, &payload)? else {
            return Ok(references);
        };
        if first.is_empty() {
            info!(scenario = %scenario.name, "worklist empty");
            return Ok(references);
        }
        let total_rows = first
            .first()
            .and_then(|row| row.get("quantidadePaginacao"))
            .and_then(Value::as_u64)
            .map_or(first.len(), |total| total as usize);
        let total_pages = total_rows.div_ceil(self.page_size).max(1);
        references.extend(first.iter().filter_map(|row| self.reference_from_row(row)));

        for page in 2..=total_pages {
            match self.fetch_page(page, &payload)? {
                Some(rows) if !rows.is_empty() => {
                    references.extend(rows.iter().filter_map(|row| self.reference_from_row(row)));
                }
                _ => break,
            }
        }
        info!(scenario = %scenario.name, studies = references.len(), pages = total_pages, "worklist read");
        Ok(references)
    }

    /// Rows without an accession number, or from a unit with no archive, are dropped.
    pub fn reference_from_row(&self, row: &Value) -> Option<StudyReference> {
        let raw = match row.get("cd_item_pedido_his")? {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        let accession = raw.parse::<AccessionNumber>().ok()?;
        let unit = row
            .get("nm_unidade")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        let mut reference = StudyReference::new(accession);
        if !self.unit_servers.is_empty() {
            let Some(server) = self.unit_servers.get(&unit) else {
                debug!(accession = %reference.accession, unit, "unit has no archive mapping");
                return None;
            };
            reference = reference.with_hint(server.clone());
        }
        reference.exam_description = row
            .get("nm_exame")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string());
        reference.exam_order_id = match row.get("id_exame_pedido") {
            Some(Value::Number(number)) => Some(number.to_string()),
            Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        };
        Some(reference)
    }
}

impl<W: WorklistTransport> StudyLocator for WorklistHttpLocator<W> {
    fn locate(&self) -> Result<Vec<StudyReference>, RelayError> {
        let mut references = Vec::new();
        for scenario in &self.scenarios {
            references.extend(self.scenario_references(scenario)?);
        }
        Ok(dedup_references(references))
    }
}

/// Keeps the first occurrence of every accession number.
pub fn dedup_references(references: Vec<StudyReference>) -> Vec<StudyReference> {
    let mut seen = HashSet::new();
    references
        .into_iter()
        .filter(|reference| seen.insert(reference.accession.clone()))
        .collect()
}
