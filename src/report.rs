use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::ReportSettings;
use crate::domain::ReportEndpoint;
use crate::error::RelayError;
use crate::session::{SessionHandle, SessionToken};
use crate::store::{REPORT_PAYLOAD_FILE, Store};
use crate::wado::apply_session;

const PARAGRAPH_OPEN: &str =
    r"\pard\plain\qj{\fcs1\af4\ltrch\fcs0\hich\af4\dbch\af0\loch\f4\fs22\cf0 ";
const PARAGRAPH_CLOSE: &str = r"}\fcs1\af4\ltrch\fcs0\hich\af4\dbch\af0\loch\f4\fs22\par ";

pub trait ReportTransport: Send + Sync {
    /// POSTs a JSON body; a rejected session surfaces as `AuthExpired`.
    fn post(&self, url: &str, payload: &Value, token: &SessionToken) -> Result<Value, RelayError>;
}

#[derive(Clone)]
pub struct HttpReportTransport {
    client: Client,
}

impl HttpReportTransport {
    pub fn new() -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("study-relay/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RelayError::Report(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| RelayError::Report(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ReportTransport for HttpReportTransport {
    fn post(&self, url: &str, payload: &Value, token: &SessionToken) -> Result<Value, RelayError> {
        let response = apply_session(self.client.post(url), token)
            .json(payload)
            .send()
            .map_err(|err| RelayError::Report(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RelayError::AuthExpired {
                server: "report".to_string(),
            });
        }
        let text = response
            .text()
            .map_err(|err| RelayError::Report(err.to_string()))?;
        if !status.is_success() {
            return Err(RelayError::ReportStatus {
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        serde_json::from_str(&text)
            .map_err(|err| RelayError::Report(format!("response is not JSON: {err}")))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub id_laudo: String,
    pub endpoint: ReportEndpoint,
    pub payload_path: Utf8PathBuf,
    pub response: Value,
}

/// Turns a pipeline answer into a pending report on the RIS.
pub struct ReportWriter {
    settings: ReportSettings,
    transport: Arc<dyn ReportTransport>,
    session: Arc<SessionHandle>,
}

impl ReportWriter {
    pub fn new(
        settings: ReportSettings,
        transport: Arc<dyn ReportTransport>,
        session: Arc<SessionHandle>,
    ) -> Self {
        Self {
            settings,
            transport,
            session,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.auto_write
    }

    pub fn write(
        &self,
        exam_order_id: Option<&str>,
        pipeline_body: &Value,
        study_dir: &Utf8Path,
    ) -> Result<ReportOutcome, RelayError> {
        let id_laudo = exam_order_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Report("exam order id missing for this study".to_string()))?;
        let physician_id = self
            .settings
            .physician_id
            .ok_or_else(|| RelayError::Report("no executing physician configured".to_string()))?;
        let base_url = self
            .settings
            .base_url
            .as_deref()
            .ok_or_else(|| RelayError::Report("report.base_url is not configured".to_string()))?;

        let permit = self.call(
            &format!("{base_url}{}", self.settings.permit_path),
            &json!({ "idLaudo": id_value(id_laudo) }),
        )?;
        if !permit
            .get("podeExecutar")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let reason = permit
                .get("motivoBloqueio")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            return Err(RelayError::Report(format!("report {id_laudo} is locked: {reason}")));
        }

        let text = report_text(pipeline_body);
        let payload = build_payload(id_laudo, physician_id, &self.settings.title, &text, Utc::now());
        let payload_path = study_dir.join(REPORT_PAYLOAD_FILE);
        Store::write_json(&payload_path, &payload)?;

        let path = match self.settings.endpoint {
            ReportEndpoint::Write => &self.settings.write_path,
            ReportEndpoint::WriteWithReview => &self.settings.review_path,
        };
        let response = self.call(&format!("{base_url}{path}"), &payload)?;
        info!(id_laudo, endpoint = ?self.settings.endpoint, "report written");
        Ok(ReportOutcome {
            id_laudo: id_laudo.to_string(),
            endpoint: self.settings.endpoint,
            payload_path,
            response,
        })
    }

    /// One session refresh on 401, then the error stands.
    fn call(&self, url: &str, payload: &Value) -> Result<Value, RelayError> {
        let lease = self.session.lease()?;
        match self.transport.post(url, payload, &lease.token) {
            Err(err) if err.is_auth_expired() => {
                warn!(url, "report session expired; refreshing");
                let lease = self.session.refresh(lease.generation)?;
                self.transport.post(url, payload, &lease.token)
            }
            other => other,
        }
    }
}

fn id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(number) => json!(number),
        Err(_) => json!(id),
    }
}

/// Picks the narrative out of the pipeline answer.
pub fn report_text(body: &Value) -> String {
    match body {
        Value::String(text) => text.trim().to_string(),
        Value::Object(map) => ["report", "laudo", "text", "result"]
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
                Some(nested @ Value::Object(_)) => Some(report_text(nested)).filter(|t| !t.is_empty()),
                _ => None,
            })
            .unwrap_or_default(),
        _ => String::new(),
    }
}

pub fn escape_rtf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' | '{' | '}' => {
                out.push('\\');
                out.push(ch);
            }
            ' '..='~' => out.push(ch),
            _ => {
                let code = ch as u32;
                let fallback = if code <= 0xFF { code } else { u32::from(b'?') };
                let signed = if code > 0x7FFF {
                    code as i64 - 0x10000
                } else {
                    i64::from(code)
                };
                out.push_str(&format!("\\u{signed}\\'{fallback:02x}"));
            }
        }
    }
    out
}

pub fn build_rtf(title: &str, body: &str) -> String {
    let mut rtf = String::from(
        r"{\rtf1\ansi\ansicpg1252\deff0{\fonttbl{\f4\fswiss\fcharset0 Candara;}}",
    );
    rtf.push_str(r"\pard\plain\qc{\f4\fs26\b ");
    rtf.push_str(&escape_rtf(&title.to_uppercase()));
    rtf.push_str(r"}\par\pard\plain\qc{\f4\fs26 }\par ");
    let mut lines = body.lines().collect::<Vec<_>>();
    if lines.is_empty() {
        lines.push("");
    }
    for line in lines {
        rtf.push_str(PARAGRAPH_OPEN);
        rtf.push_str(&escape_rtf(line));
        rtf.push_str(PARAGRAPH_CLOSE);
    }
    rtf.push('}');
    rtf
}

pub fn build_payload(
    id_laudo: &str,
    physician_id: u64,
    title: &str,
    body: &str,
    now: DateTime<Utc>,
) -> Value {
    let title = title.to_uppercase();
    let plain = if body.is_empty() {
        title.clone()
    } else {
        format!("{title}\n\n{body}")
    };
    json!({
        "idLaudo": id_value(id_laudo),
        "idMedicoExecutante": physician_id,
        "idMedicoRevisor": physician_id,
        "textoLaudoRTF": build_rtf(&title, body),
        "textoLaudoTxt": plain,
        "pendente": true,
        "provisorio": false,
        "urgente": false,
        "idJustificativaRevisao": 0,
        "justificativaRevisao": "",
        "terceiraOpiniao": false,
        "textoDaUrgencia": null,
        "nomeContatoUrgencia": null,
        "dataHoraUrgencia": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "tags": [],
    })
}
