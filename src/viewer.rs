use std::process::Command;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::config::ViewerSettings;
use crate::domain::{AccessionNumber, ViewerKind};
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerRequest {
    /// RadiAnt-style: open the study directory.
    Directory {
        executable: Option<Utf8PathBuf>,
        path: Utf8PathBuf,
    },
    /// OsiriX/Horos-style URL scheme carrying the accession number.
    Url(String),
}

pub trait ViewerLauncher: Send + Sync {
    fn launch(&self, request: &ViewerRequest) -> Result<(), RelayError>;
}

/// Spawns the viewer process without waiting for it.
#[derive(Debug, Clone, Default)]
pub struct SystemLauncher;

impl ViewerLauncher for SystemLauncher {
    fn launch(&self, request: &ViewerRequest) -> Result<(), RelayError> {
        command_for(request)?
            .spawn()
            .map(|_| ())
            .map_err(|err| RelayError::Viewer(err.to_string()))
    }
}

/// RadiAnt gets `-cl` so studies already open in it are closed first.
fn command_for(request: &ViewerRequest) -> Result<Command, RelayError> {
    let command = match request {
        ViewerRequest::Directory { executable, path } => {
            let executable = executable
                .as_ref()
                .ok_or_else(|| RelayError::Viewer("paths.radiant_exe is not set".to_string()))?;
            let mut command = Command::new(executable.as_std_path());
            command.arg("-cl").arg("-d").arg(path.as_std_path());
            command
        }
        ViewerRequest::Url(url) => {
            let opener = if cfg!(target_os = "macos") {
                "open"
            } else if cfg!(target_os = "windows") {
                "explorer"
            } else {
                "xdg-open"
            };
            let mut command = Command::new(opener);
            command.arg(url);
            command
        }
    };
    Ok(command)
}

pub fn osirix_url(accession: &AccessionNumber) -> String {
    format!(
        "osirix://?methodName=displayStudy&AccessionNumber={}",
        accession.query_key()
    )
}

#[derive(Clone)]
pub struct ViewerHandoff {
    settings: ViewerSettings,
    launcher: Arc<dyn ViewerLauncher>,
}

impl ViewerHandoff {
    pub fn new(settings: ViewerSettings, launcher: Arc<dyn ViewerLauncher>) -> Self {
        Self { settings, launcher }
    }

    pub fn request_for(&self, accession: &AccessionNumber, placed_at: &Utf8Path) -> Option<ViewerRequest> {
        match self.settings.kind {
            ViewerKind::None => None,
            ViewerKind::Radiant => Some(ViewerRequest::Directory {
                executable: self.settings.radiant_exe.clone(),
                path: placed_at.to_path_buf(),
            }),
            ViewerKind::Osirix => Some(ViewerRequest::Url(osirix_url(accession))),
        }
    }

    /// Notifies the viewer once a study is in place. Returns the request that was issued.
    pub fn after_placement(
        &self,
        accession: &AccessionNumber,
        placed_at: &Utf8Path,
    ) -> Result<Option<ViewerRequest>, RelayError> {
        if !self.settings.open_after_placement {
            debug!(accession = %accession, "viewer handoff disabled");
            return Ok(None);
        }
        let Some(request) = self.request_for(accession, placed_at) else {
            return Ok(None);
        };
        self.launcher.launch(&request)?;
        info!(accession = %accession, request = ?request, "viewer notified");
        Ok(Some(request))
    }
}
