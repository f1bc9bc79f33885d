use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{AccessionNumber, StorageMode};
use crate::error::RelayError;
use crate::registry::ExamRegistry;
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub evicted: Vec<AccessionNumber>,
    pub skipped_in_use: Vec<AccessionNumber>,
    pub remaining: usize,
}

/// Bounds the number of locally retained studies. Invocations are serialized.
pub struct RetentionManager {
    registry: Arc<ExamRegistry>,
    cycle: Mutex<()>,
}

impl RetentionManager {
    pub fn new(registry: Arc<ExamRegistry>) -> Self {
        Self {
            registry,
            cycle: Mutex::new(()),
        }
    }

    /// Evicts the oldest retained studies until at most `max_retained` remain.
    /// Pinned studies (in flight, mid-move or being dispatched) are never touched.
    pub fn enforce(&self, max_retained: usize) -> Result<RetentionReport, RelayError> {
        let _cycle = self
            .cycle
            .lock()
            .map_err(|_| RelayError::Retention("retention lock poisoned".to_string()))?;

        let retained = self
            .registry
            .records()?
            .into_iter()
            .filter(|record| record.retains_files())
            .collect::<Vec<_>>();
        let mut count = retained.len();
        let mut report = RetentionReport::default();

        for record in retained {
            if count <= max_retained {
                break;
            }
            let accession = record.accession_number.clone();
            let Some(_claim) = self.registry.claim_for_eviction(&accession)? else {
                report.skipped_in_use.push(accession);
                continue;
            };
            Store::remove_dir(&record.storage_path).map_err(|err| {
                RelayError::Retention(format!("delete {}: {err}", record.storage_path))
            })?;
            self.registry
                .remove(&accession)
                .map_err(|err| RelayError::Retention(format!("drop record {accession}: {err}")))?;
            info!(
                accession = %accession,
                downloaded_at = %record.downloaded_at.to_rfc3339(),
                "evicted study"
            );
            report.evicted.push(accession);
            count -= 1;
        }

        if !report.skipped_in_use.is_empty() {
            warn!(skipped = ?report.skipped_in_use, "in-use studies kept past the retention limit");
        }
        report.remaining = count;
        Ok(report)
    }

    /// Transient history is metadata only; keep the newest `max_records` entries.
    pub fn trim_history(&self, max_records: usize) -> Result<usize, RelayError> {
        let _cycle = self
            .cycle
            .lock()
            .map_err(|_| RelayError::Retention("retention lock poisoned".to_string()))?;
        let history = self
            .registry
            .records()?
            .into_iter()
            .filter(|record| record.storage_mode == StorageMode::Transient)
            .collect::<Vec<_>>();
        let excess = history.len().saturating_sub(max_records);
        for record in history.iter().take(excess) {
            self.registry.remove(&record.accession_number)?;
        }
        Ok(excess)
    }

    /// Drops records of retained studies whose directory is gone.
    pub fn sweep_orphans(&self) -> Result<Vec<AccessionNumber>, RelayError> {
        let _cycle = self
            .cycle
            .lock()
            .map_err(|_| RelayError::Retention("retention lock poisoned".to_string()))?;
        let mut dropped = Vec::new();
        for record in self.registry.records()? {
            if !record.retains_files() || record.storage_path.as_std_path().exists() {
                continue;
            }
            let Some(_claim) = self.registry.claim_for_eviction(&record.accession_number)? else {
                continue;
            };
            self.registry.remove(&record.accession_number)?;
            warn!(accession = %record.accession_number, path = %record.storage_path, "dropped orphan record");
            dropped.push(record.accession_number);
        }
        Ok(dropped)
    }
}
