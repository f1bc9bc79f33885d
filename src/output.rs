use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::AccessionNumber;
use crate::router::RouteOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed(RouteOutcome),
    Skipped { reason: String },
    Failed { reason: String },
}

/// Terminal result for one accession number. Every admitted study produces exactly one.
#[derive(Debug, Clone, Serialize)]
pub struct StudyOutcome {
    pub accession: AccessionNumber,
    #[serde(flatten)]
    pub kind: OutcomeKind,
}

impl StudyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed { .. })
    }
}

pub trait OutcomeSink: Send + Sync {
    fn report(&self, outcome: &StudyOutcome);
}

/// One JSON document per line on stdout.
#[derive(Debug, Default)]
pub struct JsonOutput {
    lock: Mutex<()>,
}

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl OutcomeSink for JsonOutput {
    fn report(&self, outcome: &StudyOutcome) {
        let _guard = self.lock.lock();
        let line = match serde_json::to_string(outcome) {
            Ok(line) => line,
            Err(err) => {
                warn!(accession = %outcome.accession, error = %err, "outcome not serializable");
                return;
            }
        };
        let mut stdout = io::stdout().lock();
        if writeln!(stdout, "{line}").is_err() {
            warn!(accession = %outcome.accession, "stdout closed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOutput;

impl OutcomeSink for LogOutput {
    fn report(&self, outcome: &StudyOutcome) {
        match &outcome.kind {
            OutcomeKind::Completed(route) => info!(
                accession = %outcome.accession,
                mode = %route.mode,
                server = %route.server,
                instances = route.instance_count,
                via_secondary = route.via_secondary,
                path = %route.storage_path,
                "study completed"
            ),
            OutcomeKind::Skipped { reason } => {
                info!(accession = %outcome.accession, reason = %reason, "study skipped")
            }
            OutcomeKind::Failed { reason } => {
                warn!(accession = %outcome.accession, reason = %reason, "study failed")
            }
        }
    }
}

/// Collects outcomes in memory.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    outcomes: Mutex<Vec<StudyOutcome>>,
}

impl MemoryOutput {
    pub fn outcomes(&self) -> Vec<StudyOutcome> {
        self.outcomes
            .lock()
            .map(|outcomes| outcomes.clone())
            .unwrap_or_default()
    }
}

impl OutcomeSink for MemoryOutput {
    fn report(&self, outcome: &StudyOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome.clone());
        }
    }
}
