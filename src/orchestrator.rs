use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{AccessionNumber, StudyReference};
use crate::error::RelayError;
use crate::locator::StudyLocator;
use crate::output::{OutcomeKind, OutcomeSink, StudyOutcome};
use crate::retrieval::{DownloadEngine, RetrievalJob};
use crate::router::StorageRouter;
use crate::wado::{ArchiveServer, ArchiveTransport};

const WORKER_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already queued or in flight.
    Duplicate,
}

#[derive(Debug)]
pub enum QueueItem {
    Job(StudyReference),
    Idle,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<StudyReference>,
    active: HashSet<AccessionNumber>,
    closed: bool,
}

/// FIFO of admitted studies. An accession stays in the active set from admission until
/// `complete`, so at most one job per accession exists at any time.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, RelayError> {
        self.state
            .lock()
            .map_err(|_| RelayError::Filesystem("job queue lock poisoned".to_string()))
    }

    pub fn enqueue(&self, reference: StudyReference) -> Result<Admission, RelayError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(RelayError::Stopped);
        }
        if !state.active.insert(reference.accession.clone()) {
            return Ok(Admission::Duplicate);
        }
        state.pending.push_back(reference);
        drop(state);
        self.ready.notify_one();
        Ok(Admission::Admitted)
    }

    /// Waits up to `timeout` for work. A closed queue still hands out what is pending.
    pub fn next(&self, timeout: Duration) -> Result<QueueItem, RelayError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(reference) = state.pending.pop_front() {
                return Ok(QueueItem::Job(reference));
            }
            if state.closed {
                return Ok(QueueItem::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(QueueItem::Idle);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| RelayError::Filesystem("job queue lock poisoned".to_string()))?
                .0;
        }
    }

    pub fn complete(&self, accession: &AccessionNumber) -> Result<(), RelayError> {
        self.lock()?.active.remove(accession);
        Ok(())
    }

    /// Stops admissions; workers drain what is pending.
    pub fn close(&self) -> Result<(), RelayError> {
        self.lock()?.closed = true;
        self.ready.notify_all();
        Ok(())
    }

    /// Stops admissions and withdraws everything not yet started.
    pub fn cancel(&self) -> Result<Vec<StudyReference>, RelayError> {
        let mut state = self.lock()?;
        state.closed = true;
        let withdrawn = state.pending.drain(..).collect::<Vec<_>>();
        for reference in &withdrawn {
            state.active.remove(&reference.accession);
        }
        drop(state);
        self.ready.notify_all();
        Ok(withdrawn)
    }

    pub fn is_active(&self, accession: &AccessionNumber) -> Result<bool, RelayError> {
        Ok(self.lock()?.active.contains(accession))
    }

    pub fn active_count(&self) -> Result<usize, RelayError> {
        Ok(self.lock()?.active.len())
    }

    pub fn pending_count(&self) -> Result<usize, RelayError> {
        Ok(self.lock()?.pending.len())
    }
}

#[derive(Debug, Default)]
struct ControlState {
    stopped: bool,
    paused: bool,
}

/// Graceful stop plus pause/resume. Cloned handles share state.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, apply: impl FnOnce(&mut ControlState)) {
        let (lock, signal) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            apply(&mut state);
        }
        signal.notify_all();
    }

    /// In-flight studies still finish; nothing new starts.
    pub fn stop(&self) {
        self.update(|state| {
            state.stopped = true;
            state.paused = false;
        });
    }

    pub fn pause(&self) {
        self.update(|state| state.paused = true);
    }

    pub fn resume(&self) {
        self.update(|state| state.paused = false);
    }

    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|state| state.stopped).unwrap_or(true)
    }

    pub fn is_paused(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|state| state.paused).unwrap_or(false)
    }

    /// Blocks while paused. `false` once stopped.
    pub fn wait_if_paused(&self) -> bool {
        let (lock, signal) = &*self.inner;
        let Ok(mut state) = lock.lock() else {
            return false;
        };
        while state.paused && !state.stopped {
            state = match signal.wait(state) {
                Ok(state) => state,
                Err(_) => return false,
            };
        }
        !state.stopped
    }

    /// Sleeps for `duration` unless stopped first. `false` when stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, signal) = &*self.inner;
        let deadline = Instant::now() + duration;
        let Ok(mut state) = lock.lock() else {
            return false;
        };
        while !state.stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = match signal.wait_timeout(state, deadline - now) {
                Ok((state, _)) => state,
                Err(_) => return false,
            };
        }
        false
    }
}

/// Retrieval followed by placement for a single study.
pub struct Relay<T: ArchiveTransport> {
    engine: DownloadEngine<T>,
    router: StorageRouter,
    servers: Vec<ArchiveServer>,
}

impl<T: ArchiveTransport> Relay<T> {
    pub fn new(engine: DownloadEngine<T>, router: StorageRouter, servers: Vec<ArchiveServer>) -> Self {
        Self {
            engine,
            router,
            servers,
        }
    }

    pub fn router(&self) -> &StorageRouter {
        &self.router
    }

    pub fn servers(&self) -> &[ArchiveServer] {
        &self.servers
    }

    pub fn job_for(&self, reference: StudyReference) -> RetrievalJob {
        RetrievalJob::new(reference, &self.servers)
    }

    /// Never fails: every error becomes a reported outcome for that study.
    pub fn process(&self, job: RetrievalJob) -> StudyOutcome {
        let accession = job.accession().clone();
        let result = self
            .engine
            .retrieve(job)
            .and_then(|artifact| self.router.route(artifact));
        let kind = match result {
            Ok(route) => OutcomeKind::Completed(route),
            Err(err) if err.is_skip() => OutcomeKind::Skipped {
                reason: err.to_string(),
            },
            Err(err) => OutcomeKind::Failed {
                reason: err.to_string(),
            },
        };
        StudyOutcome { accession, kind }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub located: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub orphans_dropped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopSummary {
    pub cycles: usize,
    pub admitted: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl LoopSummary {
    fn record(&mut self, outcome: &StudyOutcome) {
        match outcome.kind {
            OutcomeKind::Completed(_) => self.completed += 1,
            OutcomeKind::Skipped { .. } => self.skipped += 1,
            OutcomeKind::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct OrchestrationLoop<T: ArchiveTransport, L: StudyLocator> {
    relay: Relay<T>,
    locator: L,
    queue: JobQueue,
    control: StopHandle,
    sink: Arc<dyn OutcomeSink>,
    interval: Duration,
    workers: usize,
    summary: Mutex<LoopSummary>,
}

impl<T: ArchiveTransport, L: StudyLocator> OrchestrationLoop<T, L> {
    pub fn new(
        relay: Relay<T>,
        locator: L,
        sink: Arc<dyn OutcomeSink>,
        interval: Duration,
        workers: usize,
    ) -> Self {
        Self {
            relay,
            locator,
            queue: JobQueue::new(),
            control: StopHandle::new(),
            sink,
            interval,
            workers: workers.max(1),
            summary: Mutex::new(LoopSummary::default()),
        }
    }

    pub fn control(&self) -> StopHandle {
        self.control.clone()
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Runs until stopped.
    pub fn run(&self) -> Result<LoopSummary, RelayError> {
        self.drive(false)
    }

    /// One locate pass; returns once every admitted study has an outcome.
    pub fn run_once(&self) -> Result<LoopSummary, RelayError> {
        self.drive(true)
    }

    fn drive(&self, once: bool) -> Result<LoopSummary, RelayError> {
        info!(workers = self.workers, mode = %self.relay.router().mode(), "relay loop starting");
        let driven = thread::scope(|scope| {
            for worker in 0..self.workers {
                scope.spawn(move || self.work(worker));
            }
            let driven = self.cycles(once);
            let finished = self.finish();
            driven.and(finished)
        });
        driven?;
        let summary = self
            .summary
            .lock()
            .map(|summary| summary.clone())
            .unwrap_or_default();
        info!(
            cycles = summary.cycles,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "relay loop finished"
        );
        Ok(summary)
    }

    fn cycles(&self, once: bool) -> Result<(), RelayError> {
        loop {
            if !self.control.wait_if_paused() {
                return Ok(());
            }
            let report = self.run_cycle()?;
            debug!(?report, "cycle done");
            if once || !self.control.sleep(self.interval) {
                return Ok(());
            }
        }
    }

    /// Withdraws unstarted work on stop, then lets workers drain and exit.
    fn finish(&self) -> Result<(), RelayError> {
        if self.control.is_stopped() {
            for reference in self.queue.cancel()? {
                self.emit(StudyOutcome {
                    accession: reference.accession,
                    kind: OutcomeKind::Skipped {
                        reason: "relay stopped before the study started".to_string(),
                    },
                });
            }
        }
        self.queue.close()
    }

    /// Orphan sweep, locate, admit. Locator failures only cost this cycle.
    pub fn run_cycle(&self) -> Result<CycleReport, RelayError> {
        let mut report = CycleReport::default();
        match self.relay.router().retention().sweep_orphans() {
            Ok(dropped) => report.orphans_dropped = dropped.len(),
            Err(err) => warn!(error = %err, "orphan sweep skipped"),
        }
        let references = match self.locator.locate() {
            Ok(references) => references,
            Err(err) => {
                warn!(error = %err, "locator failed; retrying next cycle");
                return Ok(report);
            }
        };
        report.located = references.len();
        for reference in references {
            if self.control.is_stopped() {
                break;
            }
            let accession = reference.accession.clone();
            match self.queue.enqueue(reference)? {
                Admission::Admitted => report.admitted += 1,
                Admission::Duplicate => {
                    debug!(accession = %accession, "already queued or in flight");
                    report.duplicates += 1;
                }
            }
        }
        if let Ok(mut summary) = self.summary.lock() {
            summary.cycles += 1;
            summary.admitted += report.admitted;
        }
        info!(
            located = report.located,
            admitted = report.admitted,
            duplicates = report.duplicates,
            "cycle queued"
        );
        Ok(report)
    }

    fn work(&self, worker: usize) {
        loop {
            self.control.wait_if_paused();
            let reference = match self.queue.next(WORKER_POLL) {
                Ok(QueueItem::Job(reference)) => reference,
                Ok(QueueItem::Idle) => continue,
                Ok(QueueItem::Closed) => break,
                Err(err) => {
                    warn!(worker, error = %err, "worker stopping");
                    break;
                }
            };
            let accession = reference.accession.clone();
            debug!(worker, accession = %accession, "job started");
            let outcome = self.relay.process(self.relay.job_for(reference));
            if let Err(err) = self.queue.complete(&accession) {
                warn!(worker, accession = %accession, error = %err, "job not released");
            }
            self.emit(outcome);
        }
    }

    fn emit(&self, outcome: StudyOutcome) {
        if let Ok(mut summary) = self.summary.lock() {
            summary.record(&outcome);
        }
        self.sink.report(&outcome);
    }
}
