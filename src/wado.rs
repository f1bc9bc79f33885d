use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::domain::{AccessionNumber, ServerName};
use crate::error::RelayError;
use crate::session::SessionToken;

/// A named archive endpoint, e.g. `HAC` at `http://wado-hac:1000/WADO/AETILE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveServer {
    pub name: ServerName,
    pub base_url: String,
}

impl ArchiveServer {
    pub fn new(name: ServerName, base_url: &str) -> Self {
        Self {
            name,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn layout_url(&self, accession: &AccessionNumber) -> String {
        format!(
            "{}?requestType=WADO&accessionNumber={}&contentType=text/xml",
            self.base_url,
            accession.query_key()
        )
    }

    pub fn instance_url(&self, study_uid: &str, instance: &InstanceRef) -> String {
        format!(
            "{}?requestType=WADO&studyUID={study_uid}&seriesUID={}&objectUID={}&contentType=application/dicom",
            self.base_url, instance.series_uid, instance.sop_uid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyLayout {
    pub study_uid: String,
    pub series: Vec<SeriesLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesLayout {
    pub series_uid: String,
    pub instances: Vec<String>,
}

impl StudyLayout {
    pub fn total_instances(&self) -> usize {
        self.series.iter().map(|series| series.instances.len()).sum()
    }

    pub fn instances(&self) -> Vec<InstanceRef> {
        let mut refs = Vec::with_capacity(self.total_instances());
        for (series_index, series) in self.series.iter().enumerate() {
            for (instance_index, sop_uid) in series.instances.iter().enumerate() {
                refs.push(InstanceRef {
                    series_uid: series.series_uid.clone(),
                    sop_uid: sop_uid.clone(),
                    series_index,
                    instance_index,
                });
            }
        }
        refs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub series_uid: String,
    pub sop_uid: String,
    pub series_index: usize,
    pub instance_index: usize,
}

/// Network seam for the download engine; tests substitute an in-memory archive.
pub trait ArchiveTransport: Send + Sync {
    fn query_study(
        &self,
        server: &ArchiveServer,
        accession: &AccessionNumber,
        token: &SessionToken,
    ) -> Result<StudyLayout, RelayError>;

    /// Writes the instance body to `destination` and returns the byte count.
    fn fetch_instance(
        &self,
        server: &ArchiveServer,
        study_uid: &str,
        instance: &InstanceRef,
        destination: &Path,
        token: &SessionToken,
    ) -> Result<u64, RelayError>;
}

#[derive(Clone)]
pub struct WadoHttpClient {
    client: Client,
}

impl WadoHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("study-relay/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RelayError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|err| RelayError::ServerUnavailable {
                server: "-".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send(
        &self,
        server: &ArchiveServer,
        request: RequestBuilder,
    ) -> Result<reqwest::blocking::Response, RelayError> {
        let response = request
            .send()
            .map_err(|err| RelayError::ServerUnavailable {
                server: server.name.to_string(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RelayError::AuthExpired {
                server: server.name.to_string(),
            });
        }
        if !status.is_success() {
            return Err(RelayError::ArchiveStatus {
                server: server.name.to_string(),
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            });
        }
        Ok(response)
    }
}

pub fn apply_session(mut request: RequestBuilder, token: &SessionToken) -> RequestBuilder {
    if let Some(authorization) = &token.authorization {
        request = request.header(AUTHORIZATION, authorization);
    }
    if let Some(cookies) = token.cookie_header() {
        request = request.header(COOKIE, cookies);
    }
    if let Some(agent) = &token.user_agent {
        request = request.header(USER_AGENT, agent);
    }
    request
}

impl ArchiveTransport for WadoHttpClient {
    fn query_study(
        &self,
        server: &ArchiveServer,
        accession: &AccessionNumber,
        token: &SessionToken,
    ) -> Result<StudyLayout, RelayError> {
        let url = server.layout_url(accession);
        let response = self.send(server, apply_session(self.client.get(url), token))?;
        let body = response
            .bytes()
            .map_err(|err| RelayError::ServerUnavailable {
                server: server.name.to_string(),
                message: err.to_string(),
            })?;
        parse_study_layout(&body, accession)
    }

    fn fetch_instance(
        &self,
        server: &ArchiveServer,
        study_uid: &str,
        instance: &InstanceRef,
        destination: &Path,
        token: &SessionToken,
    ) -> Result<u64, RelayError> {
        let url = server.instance_url(study_uid, instance);
        let mut response = self.send(server, apply_session(self.client.get(url), token))?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }
        let mut file =
            fs::File::create(destination).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        let written = io::copy(&mut response, &mut file).map_err(|err| {
            RelayError::ServerUnavailable {
                server: server.name.to_string(),
                message: format!("stream interrupted: {err}"),
            }
        })?;
        file.flush()
            .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Ok(written)
    }
}

/// Decodes the archive's XML answer, which some servers send as UTF-16 with a BOM.
pub fn decode_xml_body(body: &[u8]) -> String {
    let utf16 = |bytes: &[u8], little: bool| {
        let units = bytes
            .chunks_exact(2)
            .map(|pair| {
                if little {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect::<Vec<_>>();
        String::from_utf16_lossy(&units)
    };
    match body {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

pub fn parse_study_layout(
    body: &[u8],
    accession: &AccessionNumber,
) -> Result<StudyLayout, RelayError> {
    let not_found = |message: &str| RelayError::StudyNotFound {
        accession: accession.to_string(),
        message: message.to_string(),
    };

    let xml = decode_xml_body(body);
    if xml.trim().is_empty() {
        return Err(not_found("empty response"));
    }

    let study_re = Regex::new(r#"<(?:\w+:)?Study\b[^>]*\bStudyInstanceUID="([^"]+)""#)
        .map_err(|err| RelayError::Filesystem(err.to_string()))?;
    let series_re = Regex::new(r#"<(?:\w+:)?Series\b[^>]*\bSeriesInstanceUID="([^"]*)""#)
        .map_err(|err| RelayError::Filesystem(err.to_string()))?;
    let instance_re = Regex::new(r#"<(?:\w+:)?Instance\b[^>]*\bSOPInstanceUID="([^"]*)""#)
        .map_err(|err| RelayError::Filesystem(err.to_string()))?;

    let study_uid = match study_re.captures(&xml) {
        Some(caps) => caps[1].trim().to_string(),
        None => {
            let text = strip_tags(&xml);
            return Err(if text.is_empty() {
                not_found("no Study element in response")
            } else {
                not_found(&text)
            });
        }
    };

    let series_starts = series_re
        .captures_iter(&xml)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), caps[1].trim().to_string()))
        })
        .collect::<Vec<_>>();

    let mut series = Vec::new();
    for (idx, (start, series_uid)) in series_starts.iter().enumerate() {
        if series_uid.is_empty() {
            continue;
        }
        let end = series_starts
            .get(idx + 1)
            .map(|(next, _)| *next)
            .unwrap_or(xml.len());
        let instances = instance_re
            .captures_iter(&xml[*start..end])
            .map(|caps| caps[1].trim().to_string())
            .filter(|uid| !uid.is_empty())
            .collect::<Vec<_>>();
        series.push(SeriesLayout {
            series_uid: series_uid.clone(),
            instances,
        });
    }

    let layout = StudyLayout { study_uid, series };
    if layout.total_instances() == 0 {
        return Err(not_found("study has no instances"));
    }
    Ok(layout)
}

fn strip_tags(xml: &str) -> String {
    let mut text = String::new();
    let mut in_tag = false;
    for ch in xml.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
