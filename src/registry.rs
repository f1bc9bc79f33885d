use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{AccessionNumber, ServerName, StorageMode};
use crate::error::RelayError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Complete,
    PipelineError,
    ReportError,
}

/// Durable trace of a placed study. For transient placements this is the only thing kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamRecord {
    pub accession_number: AccessionNumber,
    pub patient_name: String,
    pub modality: String,
    pub study_description: String,
    pub normalized_age: Option<String>,
    pub storage_path: Utf8PathBuf,
    pub downloaded_at: DateTime<Utc>,
    pub storage_mode: StorageMode,
    pub status: RecordStatus,
    pub server: ServerName,
    #[serde(default)]
    pub exam_order_id: Option<String>,
    #[serde(default)]
    pub instance_count: usize,
}

impl ExamRecord {
    pub fn retains_files(&self) -> bool {
        self.storage_mode.retains_files()
    }
}

#[derive(Default)]
struct RegistryState {
    records: BTreeMap<AccessionNumber, ExamRecord>,
    pins: HashMap<AccessionNumber, usize>,
    evicting: HashSet<AccessionNumber>,
}

/// Single source of truth for "is this accession retained" and for which accessions are
/// in flight. Mutations are written through to `records/<AN>.json`.
pub struct ExamRegistry {
    store: Store,
    state: Mutex<RegistryState>,
    released: Condvar,
}

impl ExamRegistry {
    pub fn open(store: Store) -> Result<Self, RelayError> {
        let mut records = BTreeMap::new();
        let dir = store.records_dir().as_std_path();
        if dir.exists() {
            let entries = fs::read_dir(dir).map_err(|err| RelayError::Filesystem(err.to_string()))?;
            for entry in entries {
                let path = entry
                    .map_err(|err| RelayError::Filesystem(err.to_string()))?
                    .path();
                if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                    continue;
                }
                let parsed = fs::read_to_string(&path)
                    .map_err(|err| err.to_string())
                    .and_then(|content| {
                        serde_json::from_str::<ExamRecord>(&content).map_err(|err| err.to_string())
                    });
                match parsed {
                    Ok(record) => {
                        records.insert(record.accession_number.clone(), record);
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
                }
            }
        }
        debug!(count = records.len(), "registry loaded");
        Ok(Self {
            store,
            state: Mutex::new(RegistryState {
                records,
                ..RegistryState::default()
            }),
            released: Condvar::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, RelayError> {
        self.state
            .lock()
            .map_err(|_| RelayError::Filesystem("registry lock poisoned".to_string()))
    }

    pub fn contains(&self, accession: &AccessionNumber) -> Result<bool, RelayError> {
        Ok(self.lock()?.records.contains_key(accession))
    }

    pub fn get(&self, accession: &AccessionNumber) -> Result<Option<ExamRecord>, RelayError> {
        Ok(self.lock()?.records.get(accession).cloned())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<ExamRecord>, RelayError> {
        let mut records = self.lock()?.records.values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| {
            a.downloaded_at
                .cmp(&b.downloaded_at)
                .then_with(|| a.accession_number.cmp(&b.accession_number))
        });
        Ok(records)
    }

    pub fn retained_count(&self) -> Result<usize, RelayError> {
        Ok(self
            .lock()?
            .records
            .values()
            .filter(|record| record.retains_files())
            .count())
    }

    pub fn upsert(&self, record: ExamRecord) -> Result<(), RelayError> {
        let mut state = self.lock()?;
        Store::write_json(&self.store.record_path(&record.accession_number), &record)?;
        state.records.insert(record.accession_number.clone(), record);
        Ok(())
    }

    pub fn set_status(
        &self,
        accession: &AccessionNumber,
        status: RecordStatus,
    ) -> Result<(), RelayError> {
        let mut state = self.lock()?;
        let Some(record) = state.records.get_mut(accession) else {
            return Ok(());
        };
        record.status = status;
        let snapshot = record.clone();
        Store::write_json(&self.store.record_path(accession), &snapshot)
    }

    pub fn remove(&self, accession: &AccessionNumber) -> Result<Option<ExamRecord>, RelayError> {
        let mut state = self.lock()?;
        let path = self.store.record_path(accession);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(RelayError::Filesystem(format!("remove {path}: {err}"))),
        }
        Ok(state.records.remove(accession))
    }

    /// Marks an accession as in use. Blocks while that accession is being evicted.
    pub fn pin(self: &Arc<Self>, accession: &AccessionNumber) -> Result<PinGuard, RelayError> {
        let mut state = self.lock()?;
        while state.evicting.contains(accession) {
            state = self
                .released
                .wait(state)
                .map_err(|_| RelayError::Filesystem("registry lock poisoned".to_string()))?;
        }
        *state.pins.entry(accession.clone()).or_insert(0) += 1;
        Ok(PinGuard {
            registry: Arc::clone(self),
            accession: accession.clone(),
            eviction: false,
        })
    }

    pub fn is_pinned(&self, accession: &AccessionNumber) -> Result<bool, RelayError> {
        Ok(self.lock()?.pins.get(accession).copied().unwrap_or(0) > 0)
    }

    /// Claims an unpinned accession for eviction; `None` when something holds it.
    pub fn claim_for_eviction(
        self: &Arc<Self>,
        accession: &AccessionNumber,
    ) -> Result<Option<PinGuard>, RelayError> {
        let mut state = self.lock()?;
        if state.pins.get(accession).copied().unwrap_or(0) > 0
            || state.evicting.contains(accession)
        {
            return Ok(None);
        }
        state.evicting.insert(accession.clone());
        Ok(Some(PinGuard {
            registry: Arc::clone(self),
            accession: accession.clone(),
            eviction: true,
        }))
    }

    fn release(&self, accession: &AccessionNumber, eviction: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if eviction {
            state.evicting.remove(accession);
        } else if let Some(count) = state.pins.get_mut(accession) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(accession);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

/// Keeps an accession out of eviction while held.
pub struct PinGuard {
    registry: Arc<ExamRegistry>,
    accession: AccessionNumber,
    eviction: bool,
}

impl PinGuard {
    pub fn accession(&self) -> &AccessionNumber {
        &self.accession
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGuard")
            .field("accession", &self.accession)
            .field("eviction", &self.eviction)
            .finish()
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.release(&self.accession, self.eviction);
    }
}
