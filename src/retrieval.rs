use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::RetrievalSettings;
use crate::domain::{AccessionNumber, ServerName, StudyReference};
use crate::error::RelayError;
use crate::registry::{ExamRegistry, PinGuard};
use crate::session::{SessionHandle, SessionToken};
use crate::wado::{ArchiveServer, ArchiveTransport, InstanceRef, StudyLayout};

/// Refreshes in a row whose new token the archive rejects before ever honouring it.
const MAX_UNHONOURED_REFRESHES: u32 = 2;
const DICM_OFFSET: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One study's retrieval. Lives only as long as `DownloadEngine::retrieve`.
#[derive(Debug, Clone)]
pub struct RetrievalJob {
    pub reference: StudyReference,
    pub candidates: Vec<ArchiveServer>,
    pub attempts: BTreeMap<ServerName, u32>,
    pub status: JobStatus,
    pub force: bool,
}

impl RetrievalJob {
    /// Hinted servers first, then the configured order.
    pub fn new(reference: StudyReference, servers: &[ArchiveServer]) -> Self {
        let mut candidates: Vec<ArchiveServer> = Vec::with_capacity(servers.len());
        for hint in &reference.server_hints {
            match servers.iter().find(|server| &server.name == hint) {
                Some(server) if !candidates.contains(server) => candidates.push(server.clone()),
                Some(_) => {}
                None => warn!(accession = %reference.accession, server = %hint, "hint names an unknown server"),
            }
        }
        for server in servers {
            if !candidates.contains(server) {
                candidates.push(server.clone());
            }
        }
        Self::with_candidates(reference, candidates)
    }

    /// Single-server request; no failover.
    pub fn manual(reference: StudyReference, server: ArchiveServer) -> Self {
        Self::with_candidates(reference, vec![server])
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn with_candidates(reference: StudyReference, candidates: Vec<ArchiveServer>) -> Self {
        Self {
            reference,
            candidates,
            attempts: BTreeMap::new(),
            status: JobStatus::Pending,
            force: false,
        }
    }

    pub fn accession(&self) -> &AccessionNumber {
        &self.reference.accession
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting(usize),
    Retrying { server: usize, attempt: u32 },
    Complete { server: usize },
    Failed,
}

/// `Pending -> Attempting(i) -> {Retrying(i) | Attempting(i+1)} -> {Complete | Failed}`
#[derive(Debug, Clone)]
pub struct FailoverMachine {
    server_count: usize,
    max_retries: u32,
    failures: Vec<u32>,
    state: AttemptState,
}

impl FailoverMachine {
    pub fn new(server_count: usize, max_retries: u32) -> Self {
        Self {
            server_count,
            max_retries,
            failures: vec![0; server_count],
            state: AttemptState::Pending,
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn failures(&self) -> &[u32] {
        &self.failures
    }

    pub fn start(&mut self) -> Option<usize> {
        if self.server_count == 0 {
            self.state = AttemptState::Failed;
            return None;
        }
        self.state = AttemptState::Attempting(0);
        Some(0)
    }

    pub fn current(&self) -> Option<usize> {
        match self.state {
            AttemptState::Attempting(server) | AttemptState::Retrying { server, .. } => Some(server),
            _ => None,
        }
    }

    pub fn succeed(&mut self) {
        if let Some(server) = self.current() {
            self.state = AttemptState::Complete { server };
        }
    }

    /// Counts a failure against the current server; retries it until the budget is spent.
    pub fn fail(&mut self) -> AttemptState {
        let Some(server) = self.current() else {
            return self.state.clone();
        };
        self.failures[server] += 1;
        self.state = if self.failures[server] <= self.max_retries {
            AttemptState::Retrying {
                server,
                attempt: self.failures[server],
            }
        } else {
            self.advance(server)
        };
        self.state.clone()
    }

    /// Gives up on the current server without spending retries (definitive answers).
    pub fn abandon(&mut self) -> AttemptState {
        let Some(server) = self.current() else {
            return self.state.clone();
        };
        self.failures[server] += 1;
        self.state = self.advance(server);
        self.state.clone()
    }

    fn advance(&self, server: usize) -> AttemptState {
        if server + 1 < self.server_count {
            AttemptState::Attempting(server + 1)
        } else {
            AttemptState::Failed
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_wait: Duration,
}

impl From<&RetrievalSettings> for RetryPolicy {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            max_retries: settings.retries,
            retry_wait: settings.retry_wait,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedInstance {
    pub series_uid: String,
    pub sop_uid: String,
    pub series_index: usize,
    pub instance_index: usize,
    pub path: PathBuf,
    pub size: u64,
    pub server: ServerName,
}

/// Verified, complete study in a scratch directory. Dropping it deletes the files and
/// releases the accession's pin.
#[derive(Debug)]
pub struct StagingArtifact {
    pub reference: StudyReference,
    pub study_uid: String,
    pub layout: StudyLayout,
    pub instances: Vec<StagedInstance>,
    pub primary_server: ServerName,
    pub first_candidate: ServerName,
    pub attempts: BTreeMap<ServerName, u32>,
    pub elapsed: Duration,
    dir: TempDir,
    _pin: PinGuard,
}

impl StagingArtifact {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn accession(&self) -> &AccessionNumber {
        &self.reference.accession
    }

    pub fn total_bytes(&self) -> u64 {
        self.instances.iter().map(|instance| instance.size).sum()
    }

    /// True when any part of the study came from a server other than the first candidate.
    pub fn retrieved_via_secondary(&self) -> bool {
        self.primary_server != self.first_candidate
            || self
                .instances
                .iter()
                .any(|instance| instance.server != self.first_candidate)
    }
}

struct JobContext<'a> {
    accession: &'a AccessionNumber,
    attempts: Mutex<BTreeMap<ServerName, u32>>,
}

impl JobContext<'_> {
    fn count_attempt(&self, server: &ServerName) {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(server.clone()).or_insert(0) += 1;
        }
    }
}

pub struct DownloadEngine<T: ArchiveTransport> {
    transport: T,
    session: Arc<SessionHandle>,
    registry: Arc<ExamRegistry>,
    policy: RetryPolicy,
    instance_workers: usize,
}

impl<T: ArchiveTransport> DownloadEngine<T> {
    pub fn new(
        transport: T,
        session: Arc<SessionHandle>,
        registry: Arc<ExamRegistry>,
        policy: RetryPolicy,
        instance_workers: usize,
    ) -> Self {
        Self {
            transport,
            session,
            registry,
            policy,
            instance_workers: instance_workers.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ExamRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Retrieves every instance of the study or nothing. Partial files are removed on error.
    pub fn retrieve(&self, mut job: RetrievalJob) -> Result<StagingArtifact, RelayError> {
        let accession = job.reference.accession.clone();
        if !job.force && self.registry.contains(&accession)? {
            return Err(RelayError::AlreadyRetained(accession.to_string()));
        }
        let first_candidate = job
            .candidates
            .first()
            .map(|server| server.name.clone())
            .ok_or_else(|| RelayError::InvalidConfig("no archive servers configured".to_string()))?;

        let pin = self.registry.pin(&accession)?;
        job.status = JobStatus::InProgress;
        let started = Instant::now();
        let ctx = JobContext {
            accession: &accession,
            attempts: Mutex::new(BTreeMap::new()),
        };

        let result = self.run(&job, &ctx);
        job.attempts = ctx
            .attempts
            .into_inner()
            .map_err(|_| RelayError::Filesystem("attempt counter poisoned".to_string()))?;

        match result {
            Ok((layout, primary_server, dir, instances)) => {
                job.status = JobStatus::Complete;
                let artifact = StagingArtifact {
                    reference: job.reference,
                    study_uid: layout.study_uid.clone(),
                    layout,
                    instances,
                    primary_server,
                    first_candidate,
                    attempts: job.attempts,
                    elapsed: started.elapsed(),
                    dir,
                    _pin: pin,
                };
                info!(
                    accession = %accession,
                    server = %artifact.primary_server,
                    instances = artifact.instances.len(),
                    bytes = artifact.total_bytes(),
                    via_secondary = artifact.retrieved_via_secondary(),
                    elapsed_ms = artifact.elapsed.as_millis() as u64,
                    "study retrieved"
                );
                Ok(artifact)
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                warn!(accession = %accession, attempts = ?job.attempts, error = %err, "retrieval failed");
                Err(err)
            }
        }
    }

    fn run(
        &self,
        job: &RetrievalJob,
        ctx: &JobContext<'_>,
    ) -> Result<(StudyLayout, ServerName, TempDir, Vec<StagedInstance>), RelayError> {
        let candidates = job.candidates.iter().collect::<Vec<_>>();
        let expected = job.reference.expected_instances;

        let (layout, layout_server) = self.with_failover(ctx, &candidates, |server, token| {
            let layout = self.transport.query_study(server, ctx.accession, token)?;
            if let Some(expected) = expected
                && layout.total_instances() < expected
            {
                return Err(RelayError::IncompleteStudy {
                    accession: ctx.accession.to_string(),
                    retrieved: layout.total_instances(),
                    expected,
                });
            }
            Ok(layout)
        })?;
        debug!(
            accession = %ctx.accession,
            server = %layout_server,
            series = layout.series.len(),
            instances = layout.total_instances(),
            "study layout resolved"
        );

        // Instances come from the server that answered the layout first.
        let start = candidates
            .iter()
            .position(|server| server.name == layout_server)
            .unwrap_or(0);
        let mut instance_order = candidates.clone();
        instance_order.rotate_left(start);

        let dir = self.registry.store().staging_dir_for(ctx.accession)?;
        let refs = layout.instances();
        let staged = self.fetch_all(ctx, &instance_order, &layout.study_uid, &refs, dir.path())?;
        if staged.len() != layout.total_instances() {
            return Err(RelayError::IncompleteStudy {
                accession: ctx.accession.to_string(),
                retrieved: staged.len(),
                expected: layout.total_instances(),
            });
        }
        Ok((layout, layout_server, dir, staged))
    }

    fn fetch_all(
        &self,
        ctx: &JobContext<'_>,
        servers: &[&ArchiveServer],
        study_uid: &str,
        refs: &[InstanceRef],
        dir: &Path,
    ) -> Result<Vec<StagedInstance>, RelayError> {
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<RelayError>> = Mutex::new(None);
        let staged: Mutex<Vec<StagedInstance>> = Mutex::new(Vec::with_capacity(refs.len()));
        let workers = self.instance_workers.min(refs.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while !abort.load(Ordering::SeqCst) {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(instance) = refs.get(index) else {
                            break;
                        };
                        match self.fetch_instance(ctx, servers, study_uid, instance, dir) {
                            Ok(done) => {
                                if let Ok(mut staged) = staged.lock() {
                                    staged.push(done);
                                }
                            }
                            Err(err) => {
                                abort.store(true, Ordering::SeqCst);
                                if let Ok(mut failure) = failure.lock() {
                                    failure.get_or_insert(err);
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });

        let mut staged = staged
            .into_inner()
            .map_err(|_| RelayError::Filesystem("staging list poisoned".to_string()))?;
        let failure = failure
            .into_inner()
            .map_err(|_| RelayError::Filesystem("failure slot poisoned".to_string()))?;
        if let Some(err) = failure {
            if err.is_auth_expired() {
                return Err(err);
            }
            warn!(accession = %ctx.accession, error = %err, "instance exhausted every server");
            return Err(RelayError::IncompleteStudy {
                accession: ctx.accession.to_string(),
                retrieved: staged.len(),
                expected: refs.len(),
            });
        }
        staged.sort_by_key(|instance| (instance.series_index, instance.instance_index));
        Ok(staged)
    }

    fn fetch_instance(
        &self,
        ctx: &JobContext<'_>,
        servers: &[&ArchiveServer],
        study_uid: &str,
        instance: &InstanceRef,
        dir: &Path,
    ) -> Result<StagedInstance, RelayError> {
        let destination = dir
            .join(format!("series_{}", instance.series_index + 1))
            .join(format!("{:04}_{}.dcm", instance.instance_index + 1, instance.sop_uid));
        let (size, server) = self.with_failover(ctx, servers, |server, token| {
            self.transport
                .fetch_instance(server, study_uid, instance, &destination, token)?;
            validate_instance(&destination)
        })?;
        Ok(StagedInstance {
            series_uid: instance.series_uid.clone(),
            sop_uid: instance.sop_uid.clone(),
            series_index: instance.series_index,
            instance_index: instance.instance_index,
            path: destination,
            size,
            server,
        })
    }

    fn with_failover<R>(
        &self,
        ctx: &JobContext<'_>,
        servers: &[&ArchiveServer],
        mut op: impl FnMut(&ArchiveServer, &SessionToken) -> Result<R, RelayError>,
    ) -> Result<(R, ServerName), RelayError> {
        let mut machine = FailoverMachine::new(servers.len(), self.policy.max_retries);
        let mut unhonoured = 0u32;
        let mut index = machine
            .start()
            .ok_or_else(|| RelayError::InvalidConfig("no archive servers configured".to_string()))?;
        loop {
            let server = servers
                .get(index)
                .ok_or_else(|| RelayError::InvalidConfig("server index out of range".to_string()))?;
            let lease = self.session.lease()?;
            match op(server, &lease.token) {
                Ok(value) => {
                    self.session.mark_accepted(lease.generation);
                    machine.succeed();
                    return Ok((value, server.name.clone()));
                }
                Err(err) if err.is_auth_expired() => {
                    // Another worker already replaced the rejected token.
                    if self
                        .session
                        .current_generation()?
                        .is_some_and(|current| current > lease.generation)
                    {
                        debug!(accession = %ctx.accession, server = %server.name, "stale session token; retrying");
                        continue;
                    }
                    if self.session.was_accepted(lease.generation) {
                        unhonoured = 0;
                    } else {
                        unhonoured += 1;
                        if unhonoured > MAX_UNHONOURED_REFRESHES {
                            warn!(
                                accession = %ctx.accession,
                                server = %server.name,
                                refreshes = MAX_UNHONOURED_REFRESHES,
                                "refreshed session keeps being rejected"
                            );
                            return Err(err);
                        }
                    }
                    warn!(accession = %ctx.accession, server = %server.name, "session rejected; refreshing");
                    self.session.refresh(lease.generation)?;
                }
                Err(err) => {
                    ctx.count_attempt(&server.name);
                    let definitive = matches!(
                        err,
                        RelayError::StudyNotFound { .. } | RelayError::IncompleteStudy { .. }
                    );
                    let next = if definitive {
                        machine.abandon()
                    } else {
                        machine.fail()
                    };
                    match next {
                        AttemptState::Retrying { attempt, .. } => {
                            debug!(
                                accession = %ctx.accession,
                                server = %server.name,
                                attempt,
                                error = %err,
                                "retrying"
                            );
                            thread::sleep(self.policy.retry_wait);
                        }
                        AttemptState::Attempting(next) => {
                            warn!(
                                accession = %ctx.accession,
                                from = %server.name,
                                to = %servers.get(next).map(|s| s.name.to_string()).unwrap_or_default(),
                                error = %err,
                                "failing over"
                            );
                            index = next;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }
}

/// A Part-10 file: non-empty with the `DICM` marker after the 128-byte preamble.
pub fn validate_instance(path: &Path) -> Result<u64, RelayError> {
    let invalid = |reason: &str| RelayError::InvalidInstance {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };
    let size = fs::metadata(path)
        .map_err(|err| invalid(&err.to_string()))?
        .len();
    if size == 0 {
        return Err(invalid("empty body"));
    }
    let mut header = [0u8; DICM_OFFSET + 4];
    let mut file = fs::File::open(path).map_err(|err| invalid(&err.to_string()))?;
    file.read_exact(&mut header)
        .map_err(|_| invalid("shorter than the DICOM preamble"))?;
    if &header[DICM_OFFSET..] != b"DICM" {
        return Err(invalid("missing DICM marker"));
    }
    Ok(size)
}
