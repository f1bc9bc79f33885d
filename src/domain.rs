use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// External study identifier; the dedup and routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessionNumber(String);

impl AccessionNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Worklists may suffix the accession with an order id (`AN_ID`); archives only know the AN.
    pub fn query_key(&self) -> &str {
        match self.0.split_once('_') {
            Some((head, _)) if !head.is_empty() => head,
            _ => &self.0,
        }
    }
}

impl fmt::Display for AccessionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccessionNumber {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= 64
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(RelayError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for AccessionNumber {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessionNumber> for String {
    fn from(value: AccessionNumber) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerName {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'));
        if !is_valid {
            return Err(RelayError::InvalidServer(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for ServerName {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerName> for String {
    fn from(value: ServerName) -> Self {
        value.0
    }
}

/// A candidate study as returned by a locator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyReference {
    pub accession: AccessionNumber,
    #[serde(default)]
    pub server_hints: Vec<ServerName>,
    #[serde(default)]
    pub expected_instances: Option<usize>,
    #[serde(default)]
    pub exam_description: Option<String>,
    #[serde(default)]
    pub exam_order_id: Option<String>,
}

impl StudyReference {
    pub fn new(accession: AccessionNumber) -> Self {
        Self {
            accession,
            server_hints: Vec::new(),
            expected_instances: None,
            exam_description: None,
            exam_order_id: None,
        }
    }

    pub fn with_hint(mut self, server: ServerName) -> Self {
        if !self.server_hints.contains(&server) {
            self.server_hints.push(server);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Persistent,
    Transient,
    Pipeline,
}

impl StorageMode {
    /// Modes whose files stay on local disk and count against the retention limit.
    pub fn retains_files(self) -> bool {
        matches!(self, StorageMode::Persistent | StorageMode::Pipeline)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Persistent => write!(f, "persistent"),
            StorageMode::Transient => write!(f, "transient"),
            StorageMode::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for StorageMode {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "persistent" => Ok(StorageMode::Persistent),
            "transient" => Ok(StorageMode::Transient),
            "pipeline" => Ok(StorageMode::Pipeline),
            other => Err(RelayError::InvalidConfig(format!(
                "unknown storage mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEncoding {
    #[default]
    Json,
    MultipartSingleFile,
}

impl fmt::Display for RequestEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestEncoding::Json => write!(f, "json"),
            RequestEncoding::MultipartSingleFile => write!(f, "multipart_single_file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerKind {
    #[default]
    None,
    Radiant,
    #[serde(alias = "horos")]
    Osirix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEndpoint {
    #[default]
    Write,
    WriteWithReview,
}
