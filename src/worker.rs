use crate::config::RunnerMode;
use crate::coverage::{subtract_coverage, CoverageSnapshot, CoverageStore};
use crate::messages::{
    channel, test_key, AssertionData, ChildMessage, FileFinishedData, Inbox, Outbox,
    ParentMessage, Poll, RunTestData, StoppedWorkerData, TestOutcome, WorkingOnData,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Adapter around a concrete test framework.
///
/// Implementations run the given files and report every test through the
/// context: `test_started` right before the test body executes and
/// `test_finished` once it has passed or failed. Instrumented code under test
/// records its executions on `ctx.coverage()`.
#[async_trait]
pub trait TestHarness: Send {
    async fn run_files(
        &mut self,
        files: &[String],
        ctx: &mut TestContext<'_>,
    ) -> anyhow::Result<()>;
}

struct InFlight {
    title_path: Vec<String>,
    file: String,
    before: CoverageSnapshot,
    started: Instant,
}

/// Per-run view a harness gets of its worker.
pub struct TestContext<'a> {
    store: &'a mut CoverageStore,
    outbox: &'a mut Outbox<ChildMessage>,
    in_flight: Option<InFlight>,
    last_file: Option<String>,
    failures: usize,
}

impl<'a> TestContext<'a> {
    fn new(store: &'a mut CoverageStore, outbox: &'a mut Outbox<ChildMessage>) -> Self {
        Self {
            store,
            outbox,
            in_flight: None,
            last_file: None,
            failures: 0,
        }
    }

    pub fn coverage(&mut self) -> &mut CoverageStore {
        self.store
    }

    pub fn test_started(&mut self, title_path: Vec<String>, file: &str) {
        if let Some(previous) = self.in_flight.take() {
            warn!(
                "Test {:?} started before {:?} finished",
                title_path, previous.title_path
            );
        }
        self.send(ChildMessage::WorkingOn(WorkingOnData {
            title_path: title_path.clone(),
            file: file.to_string(),
        }));
        self.last_file = Some(file.to_string());
        self.in_flight = Some(InFlight {
            title_path,
            file: file.to_string(),
            before: self.store.snapshot(),
            started: Instant::now(),
        });
    }

    /// Emits the outcome of the test that is in flight. Coverage is whatever
    /// the counters gained since `test_started`.
    pub fn test_finished(
        &mut self,
        title_path: Vec<String>,
        file: &str,
        body: &str,
        passed: bool,
        stack: Option<String>,
    ) -> TestOutcome {
        let (coverage, duration_ms) = match self.in_flight.take() {
            Some(in_flight) => (
                self.store.diff_since(&in_flight.before),
                in_flight.started.elapsed().as_secs_f64() * 1000.0,
            ),
            None => {
                debug!("No coverage snapshot for {:?}, reporting all of it", title_path);
                (subtract_coverage(self.store.data(), None), 0.0)
            }
        };

        let outcome = TestOutcome {
            key: test_key(&title_path, body),
            title_path,
            file: file.to_string(),
            passed,
            duration_ms,
            coverage,
            stack,
        };
        if !outcome.passed {
            self.failures += 1;
        }
        self.send(ChildMessage::Test(outcome.clone()));
        outcome
    }

    pub fn assertion(&mut self, data: AssertionData) {
        self.send(ChildMessage::Assertion(data));
    }

    /// Turns a crash inside a running test into a failed outcome for it.
    fn abort_in_flight(&mut self, err: &anyhow::Error) {
        if let Some(in_flight) = self.in_flight.as_ref() {
            let title_path = in_flight.title_path.clone();
            let file = in_flight.file.clone();
            self.test_finished(title_path, &file, "", false, Some(format!("{:?}", err)));
        }
    }

    /// File the harness was in when it gave up.
    fn crashed_file(&self) -> Option<&str> {
        self.in_flight
            .as_ref()
            .map(|in_flight| in_flight.file.as_str())
            .or(self.last_file.as_deref())
    }

    fn send(&mut self, message: ChildMessage) {
        if let Err(e) = self.outbox.send(message) {
            warn!("{}", e);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test panicked".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// Runs queued test files one after the other and reports back.
///
/// Only this task touches `store`, and only between tests, so each delta it
/// reports belongs to exactly one test.
pub struct Worker<F> {
    id: usize,
    mode: RunnerMode,
    make_harness: F,
    store: CoverageStore,
    inbox: Inbox<ParentMessage>,
    outbox: Outbox<ChildMessage>,
    queue: Vec<RunTestData>,
    state: WorkerState,
    exit_code: i32,
}

impl<F, H> Worker<F>
where
    F: FnMut() -> H + Send,
    H: TestHarness,
{
    pub fn new(
        id: usize,
        mode: RunnerMode,
        store: CoverageStore,
        make_harness: F,
        inbox: Inbox<ParentMessage>,
        outbox: Outbox<ChildMessage>,
    ) -> Self {
        Self {
            id,
            mode,
            make_harness,
            store,
            inbox,
            outbox,
            queue: Vec::new(),
            state: WorkerState::Idle,
            exit_code: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serves the inbox until the coordinator hangs up. Returns the exit code.
    pub async fn run(mut self) -> i32 {
        loop {
            if self.state == WorkerState::Stopped {
                match self.inbox.recv().await {
                    Some(message) => debug!("Worker {} stopped, ignoring {:?}", self.id, message),
                    None => break,
                }
                continue;
            }

            if self.queue.is_empty() {
                match self.inbox.recv().await {
                    Some(message) => self.handle(message),
                    None => {
                        debug!("Worker {} inbox closed", self.id);
                        break;
                    }
                }
                continue;
            }

            // A STOP that arrived while the last file ran wins over the queue.
            while let Poll::Ready(message) = self.inbox.try_recv() {
                self.handle(message);
            }
            if self.state == WorkerState::Stopped || self.queue.is_empty() {
                continue;
            }

            self.run_next().await;
        }
        self.exit_code
    }

    fn handle(&mut self, message: ParentMessage) {
        match message {
            ParentMessage::RunTests(data) => {
                debug!(
                    "Worker {} queued {} file(s)",
                    self.id,
                    data.tests_to_run.len()
                );
                self.queue.extend(data.tests_to_run);
                if self.mode == RunnerMode::Batch {
                    self.queue.sort_by(|a, b| a.test_path.cmp(&b.test_path));
                }
            }
            ParentMessage::Stop => self.stop(),
        }
    }

    fn stop(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        if !self.queue.is_empty() {
            info!(
                "Worker {} stopping, discarding {} queued file(s)",
                self.id,
                self.queue.len()
            );
            self.queue.clear();
        }
        let stopped = ChildMessage::Stopped(StoppedWorkerData {
            coverage: self.store.snapshot(),
            exit_code: self.exit_code,
        });
        if let Err(e) = self.outbox.send(stopped) {
            warn!("{}", e);
        }
        self.state = WorkerState::Stopped;
    }

    async fn run_next(&mut self) {
        let mut batch: Vec<RunTestData> = match self.mode {
            RunnerMode::Sandbox => self.queue.pop().into_iter().collect(),
            RunnerMode::Batch => std::mem::take(&mut self.queue),
        };
        let files: Vec<String> = batch.iter().map(|t| t.test_path.clone()).collect();

        self.state = WorkerState::Running;
        let started = Instant::now();
        let mut harness = (self.make_harness)();
        let mut ctx = TestContext::new(&mut self.store, &mut self.outbox);
        let result = match AssertUnwindSafe(harness.run_files(&files, &mut ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload))),
        };

        if let Err(e) = &result {
            error!("Worker {} crashed running {:?}: {:?}", self.id, files, e);
            // Files after the crashed one never ran; they go back in the queue.
            let crashed = ctx
                .crashed_file()
                .and_then(|file| files.iter().position(|f| f == file))
                .unwrap_or(0);
            ctx.abort_in_flight(e);
            let unrun = batch.split_off((crashed + 1).min(batch.len()));
            if !unrun.is_empty() {
                debug!(
                    "Worker {} requeueing {} file(s) after crash",
                    self.id,
                    unrun.len()
                );
                self.queue.extend(unrun);
                self.queue.sort_by(|a, b| a.test_path.cmp(&b.test_path));
            }
        }
        let failures = ctx.failures;
        if result.is_err() || failures > 0 {
            self.exit_code = 1;
        }

        let duration = match self.mode {
            RunnerMode::Sandbox => started.elapsed().as_secs_f64() * 1000.0,
            RunnerMode::Batch => 0.0,
        };
        for test in batch {
            let finished = ChildMessage::FileFinished(FileFinishedData {
                test_path: test.test_path,
                key: test.key,
                duration,
            });
            if let Err(e) = self.outbox.send(finished) {
                warn!("{}", e);
            }
        }
        self.state = WorkerState::Idle;
    }
}

/// Coordinator side of a spawned worker.
pub struct WorkerHandle {
    pub id: usize,
    pub outbox: Outbox<ParentMessage>,
    pub inbox: Inbox<ChildMessage>,
    pub join: JoinHandle<i32>,
}

pub fn spawn_worker<F, H>(
    id: usize,
    mode: RunnerMode,
    store: CoverageStore,
    make_harness: F,
) -> WorkerHandle
where
    F: FnMut() -> H + Send + 'static,
    H: TestHarness + 'static,
{
    let (parent_outbox, worker_inbox) = channel::<ParentMessage>();
    let (worker_outbox, parent_inbox) = channel::<ChildMessage>();
    let worker = Worker::new(id, mode, store, make_harness, worker_inbox, worker_outbox);
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        id,
        outbox: parent_outbox,
        inbox: parent_inbox,
        join,
    }
}
