use crate::config::{RunnerConfig, RunnerMode};
use crate::coverage::{merge_coverage, CoverageSnapshot, CoverageStore};
use crate::error::{FaultError, Result};
use crate::messages::{
    AssertionData, ChildMessage, Outbox, ParentMessage, RunTestData, RunTestsData, TestOutcome,
};
use crate::sqlite;
use crate::worker::{spawn_worker, TestHarness, WorkerHandle};
use futures::future::join_all;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Test file -> last known run time in milliseconds.
pub type TestDurations = HashMap<String, f64>;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub workers: usize,
    pub mode: RunnerMode,
    pub file_buffer_count: usize,
    pub timeout_ms: u64,
    /// Mean duration per test file, usually from `sqlite::load_test_durations`.
    pub durations: TestDurations,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for RunnerOptions {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            workers: config.workers,
            mode: config.mode,
            file_buffer_count: config.file_buffer_count,
            timeout_ms: config.timeout_ms,
            durations: TestDurations::new(),
        }
    }
}

impl RunnerOptions {
    /// Seeds the scheduler with the mean file durations of earlier runs. A
    /// database that does not exist yet leaves the table as it is.
    pub fn with_history(mut self, db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            debug!("No run history at {}", db_path.display());
            return Ok(self);
        }
        sqlite::check_db(db_path)?;
        let durations = sqlite::load_test_durations(db_path)?;
        debug!("Loaded {} file durations from {}", durations.len(), db_path.display());
        self.durations.extend(durations);
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TesterResults {
    pub test_results: BTreeMap<String, TestOutcome>,
    #[serde(rename = "duration")]
    pub duration_ms: f64,
}

impl TesterResults {
    pub fn from_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            test_results: outcomes.into_iter().map(|o| (o.key.clone(), o)).collect(),
            duration_ms: 0.0,
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.test_results.values()
    }

    pub fn failing(&self) -> impl Iterator<Item = &TestOutcome> {
        self.test_results.values().filter(|o| !o.passed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FinalTesterResults {
    pub results: TesterResults,
    pub coverage: CoverageSnapshot,
    pub exit_code: i32,
    pub assertions: Vec<AssertionData>,
    pub file_durations: TestDurations,
}

/// Hands test files out to workers.
///
/// The queue is ordered shortest known duration first with unknown durations
/// last. Whichever worker currently has the least pending work takes from
/// the long end of the queue, every other worker from the short end.
struct Scheduler {
    queue: VecDeque<String>,
    durations: TestDurations,
    pending: Vec<Vec<String>>,
}

impl Scheduler {
    fn new(files: &[String], durations: TestDurations, workers: usize) -> Self {
        let mut sorted: Vec<String> = files.to_vec();
        sorted.sort_by(|a, b| {
            match (durations.get(a), durations.get(b)) {
                (Some(x), Some(y)) => x.total_cmp(y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.cmp(b))
        });
        Self {
            queue: sorted.into(),
            durations,
            pending: vec![Vec::new(); workers],
        }
    }

    fn load(&self, worker: usize) -> (usize, f64) {
        let mut unknown = 0;
        let mut total = 0.0;
        for file in &self.pending[worker] {
            match self.durations.get(file) {
                Some(duration) => total += duration,
                None => unknown += 1,
            }
        }
        (unknown, total)
    }

    fn compare_load(a: (usize, f64), b: (usize, f64)) -> Ordering {
        a.0.cmp(&b.0).then_with(|| a.1.total_cmp(&b.1))
    }

    fn next_for(&mut self, worker: usize) -> Option<String> {
        let mine = self.load(worker);
        let least_loaded = (0..self.pending.len())
            .filter(|&other| other != worker)
            .all(|other| Self::compare_load(mine, self.load(other)) != Ordering::Greater);
        let file = if least_loaded {
            self.queue.pop_back()
        } else {
            self.queue.pop_front()
        }?;
        self.pending[worker].push(file.clone());
        Some(file)
    }

    fn finished(&mut self, worker: usize, test_path: &str, duration: f64) {
        if let Some(pending) = self.pending.get_mut(worker) {
            if let Some(index) = pending.iter().position(|p| p == test_path) {
                pending.remove(index);
            }
        }
        if duration > 0.0 {
            self.durations.insert(test_path.to_string(), duration);
        }
    }

    fn is_busy(&self, worker: usize) -> bool {
        self.pending.get(worker).map_or(false, |p| !p.is_empty())
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.pending.iter().all(|p| p.is_empty())
    }
}

struct WorkerMonitor {
    last_heard: Instant,
    working_on: Option<String>,
    stopped: bool,
}

fn stop_all(outboxes: &mut [Outbox<ParentMessage>]) -> Result<()> {
    for outbox in outboxes.iter_mut() {
        outbox.send(ParentMessage::Stop)?;
    }
    Ok(())
}

fn abort_all(joins: &[JoinHandle<i32>]) {
    for join in joins {
        join.abort();
    }
}

/// Runs `test_files` across worker tasks and collects every outcome.
pub async fn run_tests<F, H>(
    test_files: &[String],
    options: &RunnerOptions,
    make_harness: F,
) -> Result<FinalTesterResults>
where
    F: Fn() -> H + Clone + Send + 'static,
    H: TestHarness + 'static,
{
    let started = Instant::now();
    let worker_count = options.workers.max(1).min(test_files.len().max(1));
    let timeout = Duration::from_millis(options.timeout_ms);
    info!(
        "Running {} test file(s) on {} worker(s)",
        test_files.len(),
        worker_count
    );

    let (merged_tx, mut merged_rx) = mpsc::unbounded_channel::<(usize, ChildMessage)>();
    let mut outboxes = Vec::with_capacity(worker_count);
    let mut joins = Vec::with_capacity(worker_count);
    let mut monitors = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let WorkerHandle {
            outbox,
            mut inbox,
            join,
            ..
        } = spawn_worker(id, options.mode, CoverageStore::new(), make_harness.clone());
        let tx = merged_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if tx.send((id, message)).is_err() {
                    break;
                }
            }
        });
        outboxes.push(outbox);
        joins.push(join);
        monitors.push(WorkerMonitor {
            last_heard: Instant::now(),
            working_on: None,
            stopped: false,
        });
    }
    drop(merged_tx);

    let mut scheduler = Scheduler::new(test_files, options.durations.clone(), worker_count);
    let mut next_key = 0u64;
    for (id, outbox) in outboxes.iter_mut().enumerate() {
        let mut tests_to_run = Vec::new();
        for _ in 0..=options.file_buffer_count {
            match scheduler.next_for(id) {
                Some(test_path) => {
                    tests_to_run.push(RunTestData {
                        test_path,
                        key: next_key,
                    });
                    next_key += 1;
                }
                None => break,
            }
        }
        if !tests_to_run.is_empty() {
            outbox.send(ParentMessage::RunTests(RunTestsData { tests_to_run }))?;
        }
    }

    let mut stopping = false;
    if scheduler.is_drained() {
        stop_all(&mut outboxes)?;
        stopping = true;
    }

    let mut final_results = FinalTesterResults::default();
    while !(stopping && monitors.iter().all(|m| m.stopped)) {
        let deadline = monitors
            .iter()
            .enumerate()
            .filter(|(id, m)| !m.stopped && (stopping || scheduler.is_busy(*id)))
            .map(|(_, m)| m.last_heard + timeout)
            .min();

        let received = match deadline {
            Some(deadline) => match timeout_at(deadline, merged_rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    let now = Instant::now();
                    let (worker, monitor) = monitors
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| !m.stopped && m.last_heard + timeout <= now)
                        .min_by_key(|(_, m)| m.last_heard)
                        .unwrap_or((0, &monitors[0]));
                    let working_on = monitor
                        .working_on
                        .clone()
                        .unwrap_or_else(|| "nothing".to_string());
                    abort_all(&joins);
                    return Err(FaultError::WorkerTimeout {
                        worker,
                        timeout_ms: options.timeout_ms,
                        working_on,
                    });
                }
            },
            None => merged_rx.recv().await,
        };

        let (id, message) = match received {
            Some(received) => received,
            None => {
                let worker = monitors.iter().position(|m| !m.stopped).unwrap_or(0);
                abort_all(&joins);
                return Err(FaultError::WorkerDisconnected(worker));
            }
        };
        monitors[id].last_heard = Instant::now();

        match message {
            ChildMessage::WorkingOn(data) => {
                debug!("Worker {} working on {:?}", id, data.title_path);
                monitors[id].working_on =
                    Some(format!("{} ({})", data.title_path.join(" > "), data.file));
            }
            ChildMessage::Test(outcome) => {
                if let Some(previous) = final_results
                    .results
                    .test_results
                    .insert(outcome.key.clone(), outcome)
                {
                    warn!("Test {} reported more than once", previous.key);
                }
            }
            ChildMessage::Assertion(data) => final_results.assertions.push(data),
            ChildMessage::FileFinished(data) => {
                debug!("Worker {} finished {}", id, data.test_path);
                scheduler.finished(id, &data.test_path, data.duration);
                monitors[id].working_on = None;
                if stopping {
                    continue;
                }
                if let Some(test_path) = scheduler.next_for(id) {
                    outboxes[id].send(ParentMessage::RunTests(RunTestsData {
                        tests_to_run: vec![RunTestData {
                            test_path,
                            key: next_key,
                        }],
                    }))?;
                    next_key += 1;
                } else if scheduler.is_drained() {
                    stop_all(&mut outboxes)?;
                    stopping = true;
                }
            }
            ChildMessage::Stopped(data) => {
                debug!("Worker {} stopped with exit code {}", id, data.exit_code);
                merge_coverage(&mut final_results.coverage, &data.coverage);
                final_results.exit_code = final_results.exit_code.max(data.exit_code);
                monitors[id].stopped = true;
            }
        }
    }

    drop(outboxes);
    for joined in join_all(joins).await {
        let code =
            joined.map_err(|e| FaultError::Other(anyhow::anyhow!("worker task failed: {}", e)))?;
        final_results.exit_code = final_results.exit_code.max(code);
    }

    final_results.results.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    final_results.file_durations = scheduler.durations;
    info!(
        "Collected {} test result(s) in {:.0}ms",
        final_results.results.test_results.len(),
        final_results.results.duration_ms
    );
    Ok(final_results)
}

/// Files under `root` whose path relative to `root` matches `pattern`.
pub fn discover_test_files(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let pattern = Pattern::new(pattern)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if pattern.matches_path(relative) {
            files.push(entry.path().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
