use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{RequestEncoding, ReportEndpoint, ServerName, StorageMode, ViewerKind};
use crate::error::RelayError;
use crate::wado::ArchiveServer;

pub const DEFAULT_CONFIG_FILE: &str = "study-relay.json";
pub const PHYSICIAN_ENV: &str = "MEDICO_EXECUTANTE_ID";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub storage_mode: Option<StorageMode>,
    /// Deprecated: `storage_mode` decides placement; this only toggles series tag dumps.
    #[serde(default)]
    pub save_metadata: Option<bool>,
    #[serde(default)]
    pub metadado: Option<bool>,
    #[serde(default)]
    pub viewer: Option<ViewerKind>,
    #[serde(default)]
    pub open_viewer: Option<bool>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub settings: SettingsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub worklist: WorklistSection,
    #[serde(default)]
    pub report: ReportSection,
    #[serde(default)]
    pub scenarios: Vec<ScenarioEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServerEntry {
    /// `NAME=http://host:port/path`
    Shorthand(String),
    Detailed(ServerEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerEntryObject {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScenarioEntry {
    Shorthand(String),
    Detailed(ScenarioEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioEntryObject {
    pub name: String,
    pub payload: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PathsSection {
    pub persistent_dir: Option<String>,
    pub staging_dir: Option<String>,
    pub incoming_dir: Option<String>,
    pub records_dir: Option<String>,
    pub radiant_exe: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsSection {
    pub threads: Option<usize>,
    pub study_workers: Option<usize>,
    pub retries: Option<u32>,
    pub retry_wait_secs: Option<u64>,
    pub loop_interval_secs: Option<u64>,
    pub max_retained: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PipelineSection {
    pub enabled: Option<bool>,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub strict: Option<bool>,
    pub request_format: Option<RequestEncoding>,
    pub include_terms: Option<Vec<String>>,
    pub exclude_terms: Option<Vec<String>>,
    pub auto_write_report: Option<bool>,
    pub use_review: Option<bool>,
    pub default_physician_id: Option<u64>,
    pub report_title: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SessionSection {
    pub file: Option<String>,
    pub refresh_command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WorklistSection {
    pub base_url: Option<String>,
    pub page_size: Option<usize>,
    pub unit_servers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReportSection {
    pub base_url: Option<String>,
    pub permit_path: Option<String>,
    pub write_path: Option<String>,
    pub review_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ViewerSettings {
    pub kind: ViewerKind,
    pub open_after_placement: bool,
    pub radiant_exe: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub persistent_dir: Utf8PathBuf,
    pub staging_dir: Utf8PathBuf,
    pub incoming_dir: Option<Utf8PathBuf>,
    pub records_dir: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// Concurrent instance downloads inside one study.
    pub threads: usize,
    /// Studies processed at the same time.
    pub study_workers: usize,
    pub retries: u32,
    pub retry_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub strict: bool,
    pub encoding: RequestEncoding,
    pub include_terms: Vec<String>,
    pub exclude_terms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub auto_write: bool,
    pub endpoint: ReportEndpoint,
    pub base_url: Option<String>,
    pub permit_path: String,
    pub write_path: String,
    pub review_path: String,
    pub physician_id: Option<u64>,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub file: Utf8PathBuf,
    pub refresh_command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorklistSettings {
    pub base_url: Option<String>,
    pub page_size: usize,
    pub unit_servers: BTreeMap<String, ServerName>,
}

#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub payload_path: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub storage_mode: StorageMode,
    pub dump_series_tags: bool,
    pub viewer: ViewerSettings,
    pub servers: Vec<ArchiveServer>,
    pub paths: StoragePaths,
    pub retrieval: RetrievalSettings,
    pub loop_interval: Duration,
    pub max_retained: usize,
    pub pipeline: PipelineSettings,
    pub report: ReportSettings,
    pub session: SessionSettings,
    pub worklist: WorklistSettings,
    pub scenarios: Vec<ScenarioSpec>,
}

impl ResolvedConfig {
    pub fn server(&self, name: &ServerName) -> Option<&ArchiveServer> {
        self.servers.iter().find(|server| &server.name == name)
    }

    /// Pipeline dispatch only runs in pipeline mode with the integration switched on.
    pub fn pipeline_active(&self) -> bool {
        self.storage_mode == StorageMode::Pipeline && self.pipeline.enabled
    }
}

/// `study-relay.json` in the working directory, else in the user's config directory.
pub fn default_config_path() -> Option<Utf8PathBuf> {
    let local = Utf8PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.as_std_path().exists() {
        return Some(local);
    }
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.config_dir().join("study-relay").join(DEFAULT_CONFIG_FILE))
                .ok()
        })
        .filter(|path| path.as_std_path().exists())
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, RelayError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => default_config_path().ok_or(RelayError::MissingConfig)?,
        };

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| RelayError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RelayError::ConfigParse(err.to_string()))?;

        let base_dir = match config_path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        Self::resolve_config(config, &base_dir)
    }

    pub fn resolve_config(config: Config, base_dir: &Utf8Path) -> Result<ResolvedConfig, RelayError> {
        let env_physician = std::env::var(PHYSICIAN_ENV).ok();
        Self::resolve_config_with(config, base_dir, env_physician)
    }

    pub fn resolve_config_with(
        config: Config,
        base_dir: &Utf8Path,
        env_physician: Option<String>,
    ) -> Result<ResolvedConfig, RelayError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let viewer_kind = config.viewer.unwrap_or_default();

        let storage_mode = config.storage_mode.unwrap_or(match viewer_kind {
            ViewerKind::Osirix => StorageMode::Transient,
            ViewerKind::Radiant | ViewerKind::None => StorageMode::Persistent,
        });

        if config.metadado.is_some() {
            warn!("config key `metadado` is deprecated; use `save_metadata`");
        }
        if config.save_metadata.is_some() || config.metadado.is_some() {
            warn!(
                storage_mode = %storage_mode,
                "`save_metadata` is deprecated; storage_mode decides placement and only series tag dumps follow the flag"
            );
        }
        let legacy_dump = config.save_metadata.or(config.metadado).unwrap_or(false);
        let dump_series_tags = storage_mode == StorageMode::Pipeline || legacy_dump;

        let servers = config
            .servers
            .into_iter()
            .map(resolve_server)
            .collect::<Result<Vec<_>, RelayError>>()?;
        if servers.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one archive server is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for server in &servers {
            if !seen.insert(server.name.clone()) {
                return Err(RelayError::InvalidConfig(format!(
                    "duplicate archive server name: {}",
                    server.name
                )));
            }
        }

        let paths = StoragePaths {
            persistent_dir: resolve_path(base_dir, config.paths.persistent_dir, "data/DICOM"),
            staging_dir: resolve_path(base_dir, config.paths.staging_dir, "tmp"),
            incoming_dir: non_empty(config.paths.incoming_dir)
                .map(|value| join_relative(base_dir, &value)),
            records_dir: resolve_path(base_dir, config.paths.records_dir, "records"),
        };
        if storage_mode == StorageMode::Transient && paths.incoming_dir.is_none() {
            return Err(RelayError::InvalidConfig(
                "transient storage requires paths.incoming_dir".to_string(),
            ));
        }

        let viewer = ViewerSettings {
            kind: viewer_kind,
            open_after_placement: config.open_viewer.unwrap_or(false),
            radiant_exe: non_empty(config.paths.radiant_exe).map(Utf8PathBuf::from),
        };

        let settings = config.settings;
        let retrieval = RetrievalSettings {
            threads: settings.threads.unwrap_or(15),
            study_workers: settings.study_workers.unwrap_or(2),
            retries: settings.retries.unwrap_or(4),
            retry_wait: Duration::from_secs(settings.retry_wait_secs.unwrap_or(30)),
        };
        if retrieval.threads == 0 || retrieval.study_workers == 0 {
            return Err(RelayError::InvalidConfig(
                "settings.threads and settings.study_workers must be at least 1".to_string(),
            ));
        }
        let max_retained = settings.max_retained.unwrap_or(50);
        if max_retained == 0 {
            return Err(RelayError::InvalidConfig(
                "settings.max_retained must be at least 1".to_string(),
            ));
        }
        let loop_interval = Duration::from_secs(settings.loop_interval_secs.unwrap_or(150).max(1));

        let section = config.pipeline;
        let pipeline = PipelineSettings {
            enabled: section.enabled.unwrap_or(true),
            api_url: non_empty(section.api_url),
            api_token: non_empty(section.api_token),
            timeout: Duration::from_secs(section.timeout_secs.unwrap_or(30).max(1)),
            retries: section.retries.unwrap_or(0),
            strict: section.strict.unwrap_or(false),
            encoding: section.request_format.unwrap_or_default(),
            include_terms: normalize_terms(section.include_terms, &["TORAX"]),
            exclude_terms: normalize_terms(section.exclude_terms, &["PERFIL"]),
        };
        let pipeline_active = storage_mode == StorageMode::Pipeline && pipeline.enabled;
        if pipeline_active && pipeline.api_url.is_none() {
            return Err(RelayError::InvalidConfig(
                "pipeline mode requires pipeline.api_url (or pipeline.enabled=false)".to_string(),
            ));
        }

        let physician_id = match section.default_physician_id {
            Some(id) => Some(id),
            None => match non_empty(env_physician) {
                Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                    RelayError::InvalidConfig(format!("{PHYSICIAN_ENV} is not numeric: {raw}"))
                })?),
                None => None,
            },
        };
        let report = ReportSettings {
            auto_write: section.auto_write_report.unwrap_or(true),
            endpoint: if section.use_review.unwrap_or(false) {
                ReportEndpoint::WriteWithReview
            } else {
                ReportEndpoint::Write
            },
            base_url: non_empty(config.report.base_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            permit_path: config
                .report
                .permit_path
                .unwrap_or_else(|| "/ris/laudo/api/v1/laudo/permitirlaudar".to_string()),
            write_path: config
                .report
                .write_path
                .unwrap_or_else(|| "/ris/laudo/api/v1/laudo/laudar".to_string()),
            review_path: config
                .report
                .review_path
                .unwrap_or_else(|| "/ris/laudo/api/v1/laudo/revisar".to_string()),
            physician_id,
            title: section
                .report_title
                .unwrap_or_else(|| "RADIOGRAFIA DE TÓRAX NO LEITO".to_string()),
        };
        if pipeline_active && report.auto_write {
            if report.base_url.is_none() {
                return Err(RelayError::InvalidConfig(
                    "pipeline.auto_write_report requires report.base_url".to_string(),
                ));
            }
            if report.physician_id.is_none() {
                return Err(RelayError::InvalidConfig(format!(
                    "pipeline.auto_write_report requires pipeline.default_physician_id or {PHYSICIAN_ENV}"
                )));
            }
        }

        let session = SessionSettings {
            file: resolve_path(base_dir, config.session.file, "auth/session.json"),
            refresh_command: config.session.refresh_command.unwrap_or_default(),
        };

        let is_configured =
            |server: &ServerName| servers.iter().any(|candidate| &candidate.name == server);
        let unit_servers = match config.worklist.unit_servers {
            Some(map) => {
                let map = map
                    .into_iter()
                    .map(|(unit, server)| Ok((unit.trim().to_uppercase(), server.parse()?)))
                    .collect::<Result<BTreeMap<_, _>, RelayError>>()?;
                if let Some(server) = map.values().find(|server| !is_configured(server)) {
                    return Err(RelayError::InvalidConfig(format!(
                        "worklist.unit_servers references unknown server {server}"
                    )));
                }
                map
            }
            // built-in units only apply to servers that are actually configured
            None => default_unit_servers()?
                .into_iter()
                .filter(|(_, server)| is_configured(server))
                .collect(),
        };
        let worklist = WorklistSettings {
            base_url: non_empty(config.worklist.base_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            page_size: config.worklist.page_size.unwrap_or(25).max(1),
            unit_servers,
        };

        let scenarios = config
            .scenarios
            .into_iter()
            .map(|entry| match entry {
                ScenarioEntry::Shorthand(name) => {
                    let name = name.trim().trim_end_matches(".json").to_string();
                    ScenarioSpec {
                        payload_path: base_dir.join("queries").join(format!("{name}.json")),
                        name,
                    }
                }
                ScenarioEntry::Detailed(obj) => ScenarioSpec {
                    name: obj.name,
                    payload_path: join_relative(base_dir, &obj.payload),
                },
            })
            .collect::<Vec<_>>();
        if scenarios.iter().any(|scenario| scenario.name.is_empty()) {
            return Err(RelayError::InvalidConfig("empty scenario name".to_string()));
        }

        Ok(ResolvedConfig {
            schema_version,
            storage_mode,
            dump_series_tags,
            viewer,
            servers,
            paths,
            retrieval,
            loop_interval,
            max_retained,
            pipeline,
            report,
            session,
            worklist,
            scenarios,
        })
    }
}

fn resolve_server(entry: ServerEntry) -> Result<ArchiveServer, RelayError> {
    match entry {
        ServerEntry::Shorthand(value) => {
            let (name, url) = value
                .split_once('=')
                .ok_or_else(|| RelayError::InvalidServer(value.clone()))?;
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(RelayError::InvalidServer(value.clone()));
            }
            Ok(ArchiveServer::new(name.parse()?, url))
        }
        ServerEntry::Detailed(obj) => {
            let scheme = obj.scheme.unwrap_or_else(|| "http".to_string());
            let port = obj.port.unwrap_or(1000);
            let path = obj.path.unwrap_or_else(|| "WADO/AETILE".to_string());
            let base_url = format!(
                "{scheme}://{}:{port}/{}",
                obj.host.trim(),
                path.trim_start_matches('/')
            );
            Ok(ArchiveServer::new(obj.name.parse()?, &base_url))
        }
    }
}

fn default_unit_servers() -> Result<BTreeMap<String, ServerName>, RelayError> {
    Ok(BTreeMap::from([
        ("HAC".to_string(), "HAC".parse()?),
        ("HOBRA".to_string(), "HBR".parse()?),
    ]))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_path(base_dir: &Utf8Path, value: Option<String>, default: &str) -> Utf8PathBuf {
    let raw = non_empty(value).unwrap_or_else(|| default.to_string());
    join_relative(base_dir, &raw)
}

fn join_relative(base_dir: &Utf8Path, raw: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn normalize_terms(terms: Option<Vec<String>>, defaults: &[&str]) -> Vec<String> {
    match terms {
        Some(terms) => terms
            .into_iter()
            .map(|term| term.trim().to_uppercase())
            .filter(|term| !term.is_empty())
            .collect(),
        None => defaults.iter().map(|term| term.to_string()).collect(),
    }
}
