mod common;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;

use study_relay::domain::{RequestEncoding, StorageMode, StudyReference};
use study_relay::error::RelayError;
use study_relay::locator::{StaticLocator, StudyLocator};
use study_relay::orchestrator::OrchestrationLoop;
use study_relay::output::{MemoryOutput, OutcomeKind, OutcomeSink};
use study_relay::pipeline::{DispatchOutcome, PipelineReply, PipelineRequest, PipelineTransport};
use study_relay::store::PIPELINE_RESPONSE_FILE;

use common::{
    FakeArchive, FakeStudy, RecordingPipeline, Workspace, accession, pipeline_settings,
};

/// Hands back exactly what it was given, repeats included.
struct RawLocator(Vec<StudyReference>);

impl StudyLocator for RawLocator {
    fn locate(&self) -> Result<Vec<StudyReference>, RelayError> {
        Ok(self.0.clone())
    }
}

struct BrokenLocator;

impl StudyLocator for BrokenLocator {
    fn locate(&self) -> Result<Vec<StudyReference>, RelayError> {
        Err(RelayError::Locator("worklist answered 502".to_string()))
    }
}

/// Holds every dispatch until released.
#[derive(Default)]
struct GatedPipeline {
    open: Mutex<bool>,
    opened: Condvar,
    held: Mutex<usize>,
}

impl GatedPipeline {
    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl PipelineTransport for GatedPipeline {
    fn send(&self, _request: &PipelineRequest) -> Result<PipelineReply, RelayError> {
        *self.held.lock().unwrap() += 1;
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        Ok(PipelineReply {
            status: 200,
            body: serde_json::json!({"report": "Sem alteracoes."}),
        })
    }
}

fn reference(an: &str) -> StudyReference {
    StudyReference::new(accession(an))
}

#[test]
fn pipeline_cycle_dispatches_matching_study_and_evicts_the_rest() {
    let workspace = Workspace::new();
    let transport = Arc::new(RecordingPipeline::ok());
    let router = workspace.pipeline_router(1, pipeline_settings(RequestEncoding::Json), transport.clone());
    let relay = workspace.relay(
        FakeArchive::new(vec![
            FakeStudy::new("10001", "RX TORAX PERFIL", &[1]),
            FakeStudy::new("10002", "RX TORAX PA", &[2]),
        ]),
        router,
    );
    let output = Arc::new(MemoryOutput::default());
    let sink: Arc<dyn OutcomeSink> = output.clone();
    let relay_loop = OrchestrationLoop::new(
        relay,
        StaticLocator::new(vec![reference("10001"), reference("10002")]),
        sink,
        Duration::from_secs(60),
        1,
    );

    let summary = relay_loop.run_once().unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.admitted, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);

    let outcomes = output.outcomes();
    assert_eq!(outcomes.len(), 2);
    let lateral = outcomes
        .iter()
        .find(|outcome| outcome.accession.as_str() == "10001")
        .unwrap();
    assert_matches!(
        &lateral.kind,
        OutcomeKind::Completed(route) if matches!(route.dispatch, DispatchOutcome::Skipped { .. })
    );
    let frontal = outcomes
        .iter()
        .find(|outcome| outcome.accession.as_str() == "10002")
        .unwrap();
    let OutcomeKind::Completed(route) = &frontal.kind else {
        panic!("frontal study did not complete: {:?}", frontal.kind);
    };
    assert_matches!(route.dispatch, DispatchOutcome::Dispatched { status: 200, .. });
    assert_eq!(route.evicted, vec![accession("10001")]);

    assert_eq!(transport.requests.lock().unwrap().len(), 1);
    let study_dir = workspace.store().study_dir(&accession("10002"));
    assert!(study_dir.join(PIPELINE_RESPONSE_FILE).exists());
    assert!(!workspace.store().study_dir(&accession("10001")).exists());

    let kept = workspace.registry.records().unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].accession_number.as_str(), "10002");
}

#[test]
fn repeated_references_yield_one_outcome_each() {
    let workspace = Workspace::new();
    let relay = workspace.relay(
        FakeArchive::new(vec![
            FakeStudy::new("11001", "RX TORAX PA", &[1]),
            FakeStudy::new("11002", "RX TORAX PA", &[1]),
        ]),
        workspace.router(StorageMode::Persistent, 10),
    );
    let output = Arc::new(MemoryOutput::default());
    let relay_loop = OrchestrationLoop::new(
        relay,
        RawLocator(vec![reference("11001"), reference("11001"), reference("11002")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        3,
    );

    let summary = relay_loop.run_once().unwrap();

    assert_eq!(summary.admitted, 2);
    assert_eq!(summary.completed, 2);
    let mut seen = output
        .outcomes()
        .iter()
        .map(|outcome| outcome.accession.to_string())
        .collect::<Vec<_>>();
    seen.sort();
    assert_eq!(seen, vec!["11001", "11002"]);
}

#[test]
fn retained_study_is_skipped_on_the_next_pass() {
    let workspace = Workspace::new();
    let archive = || FakeArchive::new(vec![FakeStudy::new("12001", "RX TORAX PA", &[1])]);

    let first = OrchestrationLoop::new(
        workspace.relay(archive(), workspace.router(StorageMode::Persistent, 10)),
        StaticLocator::new(vec![reference("12001")]),
        Arc::new(MemoryOutput::default()) as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        1,
    );
    assert_eq!(first.run_once().unwrap().completed, 1);

    let output = Arc::new(MemoryOutput::default());
    let second = OrchestrationLoop::new(
        workspace.relay(archive(), workspace.router(StorageMode::Persistent, 10)),
        StaticLocator::new(vec![reference("12001")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        1,
    );
    let summary = second.run_once().unwrap();

    assert_eq!(summary.skipped, 1);
    assert_matches!(output.outcomes()[0].kind, OutcomeKind::Skipped { .. });
}

#[test]
fn failed_study_does_not_stop_the_others() {
    let workspace = Workspace::new();
    let relay = workspace.relay(
        FakeArchive::new(vec![FakeStudy::new("13002", "RX TORAX PA", &[1])]),
        workspace.router(StorageMode::Persistent, 10),
    );
    let output = Arc::new(MemoryOutput::default());
    let relay_loop = OrchestrationLoop::new(
        relay,
        StaticLocator::new(vec![reference("13001"), reference("13002")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        2,
    );

    let summary = relay_loop.run_once().unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    let missing = output
        .outcomes()
        .into_iter()
        .find(|outcome| outcome.accession.as_str() == "13001")
        .unwrap();
    assert!(missing.is_failure());
}

#[test]
fn locator_failure_costs_only_the_cycle() {
    let workspace = Workspace::new();
    let relay_loop = OrchestrationLoop::new(
        workspace.relay(FakeArchive::new(vec![]), workspace.router(StorageMode::Persistent, 10)),
        BrokenLocator,
        Arc::new(MemoryOutput::default()) as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        1,
    );

    let summary = relay_loop.run_once().unwrap();

    assert_eq!(summary.admitted, 0);
    assert_eq!(summary.failed, 0);
}

#[test]
fn stopped_loop_exits_without_work() {
    let workspace = Workspace::new();
    let output = Arc::new(MemoryOutput::default());
    let relay_loop = OrchestrationLoop::new(
        workspace.relay(
            FakeArchive::new(vec![FakeStudy::new("14001", "RX", &[1])]),
            workspace.router(StorageMode::Persistent, 10),
        ),
        StaticLocator::new(vec![reference("14001")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(3600),
        2,
    );
    relay_loop.control().stop();

    let summary = relay_loop.run().unwrap();

    assert_eq!(summary.cycles, 0);
    assert!(output.outcomes().is_empty());
    assert!(workspace.registry.records().unwrap().is_empty());
}

#[test]
fn stop_during_interval_ends_a_continuous_run() {
    let workspace = Workspace::new();
    let output = Arc::new(MemoryOutput::default());
    let relay_loop = OrchestrationLoop::new(
        workspace.relay(
            FakeArchive::new(vec![FakeStudy::new("15001", "RX", &[1])]),
            workspace.router(StorageMode::Persistent, 10),
        ),
        StaticLocator::new(vec![reference("15001")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(3600),
        1,
    );
    let control = relay_loop.control();

    let summary = std::thread::scope(|scope| {
        let running = scope.spawn(|| relay_loop.run());
        while output.outcomes().is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        control.stop();
        running.join().unwrap()
    })
    .unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.completed, 1);
}

#[test]
fn held_dispatch_blocks_only_its_own_study() {
    let workspace = Workspace::new();
    let gate = Arc::new(GatedPipeline::default());
    let router = workspace.pipeline_router(10, pipeline_settings(RequestEncoding::Json), gate.clone());
    let relay = workspace.relay(
        FakeArchive::new(vec![
            FakeStudy::new("16001", "RX TORAX PA", &[1]),
            FakeStudy::new("16002", "RX TORAX PERFIL", &[1]),
        ]),
        router,
    );
    let output = Arc::new(MemoryOutput::default());
    let relay_loop = OrchestrationLoop::new(
        relay,
        StaticLocator::new(vec![reference("16001"), reference("16002")]),
        output.clone() as Arc<dyn OutcomeSink>,
        Duration::from_secs(60),
        2,
    );

    let (while_held, summary) = std::thread::scope(|scope| {
        let running = scope.spawn(|| relay_loop.run_once());
        while output.outcomes().is_empty() || *gate.held.lock().unwrap() == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        let while_held = output
            .outcomes()
            .iter()
            .map(|outcome| outcome.accession.to_string())
            .collect::<Vec<_>>();
        gate.release();
        (while_held, running.join().unwrap())
    });

    assert_eq!(while_held, vec!["16002"]);
    let summary = summary.unwrap();
    assert_eq!(summary.completed, 2);
}
