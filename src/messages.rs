use crate::coverage::CoverageSnapshot;
use crate::error::{FaultError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// Stable identity of a test: its title path plus a hash of its body, so a
/// renamed describe block or an edited test body yields a new key.
pub fn test_key(title_path: &[String], body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{}{:x}", title_path.join("_"), hasher.finalize())
}

/// One executed test, as reported by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub key: String,
    pub title_path: Vec<String>,
    pub file: String,
    pub passed: bool,
    #[serde(rename = "duration")]
    pub duration_ms: f64,
    pub coverage: CoverageSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestData {
    pub test_path: String,
    pub key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestsData {
    pub tests_to_run: Vec<RunTestData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingOnData {
    pub title_path: Vec<String>,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionData {
    pub assertion_type: String,
    pub file: String,
    pub key: String,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub actual: Value,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFinishedData {
    pub test_path: String,
    pub key: u64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedWorkerData {
    pub coverage: CoverageSnapshot,
    pub exit_code: i32,
}

/// Coordinator -> worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ParentMessage {
    #[serde(rename = "TEST_FILE")]
    RunTests(RunTestsData),
    #[serde(rename = "STOP_WORKER")]
    Stop,
}

/// Worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChildMessage {
    #[serde(rename = "WORKING_ON_TEST")]
    WorkingOn(WorkingOnData),
    #[serde(rename = "TEST")]
    Test(TestOutcome),
    #[serde(rename = "ASSERTION")]
    Assertion(AssertionData),
    #[serde(rename = "FILE_FINISHED")]
    FileFinished(FileFinishedData),
    #[serde(rename = "STOPPED_WORKER")]
    Stopped(StoppedWorkerData),
}

impl ChildMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ChildMessage::WorkingOn(_) => "WORKING_ON_TEST",
            ChildMessage::Test(_) => "TEST",
            ChildMessage::Assertion(_) => "ASSERTION",
            ChildMessage::FileFinished(_) => "FILE_FINISHED",
            ChildMessage::Stopped(_) => "STOPPED_WORKER",
        }
    }
}

/// Wire frame: `{ "id": n, "type": ..., "data": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub id: u64,
    #[serde(flatten)]
    pub message: M,
}

pub fn encode<M: Serialize>(envelope: &Envelope<M>) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode<M: DeserializeOwned>(frame: &str) -> Result<Envelope<M>> {
    serde_json::from_str(frame)
        .map_err(|e| FaultError::Protocol(format!("malformed message ({}): {}", e, frame)))
}

/// Drops envelopes whose id does not move strictly forward.
#[derive(Debug, Default, Clone)]
pub struct SequenceGuard {
    last_id: Option<u64>,
}

impl SequenceGuard {
    pub fn accept(&mut self, id: u64) -> bool {
        match self.last_id {
            Some(last) if id <= last => false,
            _ => {
                self.last_id = Some(id);
                true
            }
        }
    }
}

/// Sending half of a typed message channel. Frames are JSON strings so the
/// same channel could be backed by a process pipe.
#[derive(Debug)]
pub struct Outbox<M> {
    tx: UnboundedSender<String>,
    next_id: u64,
    _marker: PhantomData<fn(M)>,
}

impl<M: Serialize> Outbox<M> {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self {
            tx,
            next_id: 0,
            _marker: PhantomData,
        }
    }

    pub fn send(&mut self, message: M) -> Result<()> {
        let envelope = Envelope {
            id: self.next_id,
            message,
        };
        self.next_id += 1;
        let frame = encode(&envelope)?;
        self.tx
            .send(frame)
            .map_err(|_| FaultError::Protocol("receiver has hung up".to_string()))
    }
}

#[derive(Debug, PartialEq)]
pub enum Poll<M> {
    Ready(M),
    Empty,
    Closed,
}

/// Receiving half. Malformed or replayed frames are logged and skipped.
#[derive(Debug)]
pub struct Inbox<M> {
    rx: UnboundedReceiver<String>,
    guard: SequenceGuard,
    _marker: PhantomData<fn() -> M>,
}

impl<M: DeserializeOwned> Inbox<M> {
    pub fn new(rx: UnboundedReceiver<String>) -> Self {
        Self {
            rx,
            guard: SequenceGuard::default(),
            _marker: PhantomData,
        }
    }

    fn accept(&mut self, frame: &str) -> Option<M> {
        match decode::<M>(frame) {
            Ok(envelope) => {
                if self.guard.accept(envelope.id) {
                    Some(envelope.message)
                } else {
                    warn!("Dropping duplicate or out of order message {}", envelope.id);
                    None
                }
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Next valid message, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<M> {
        while let Some(frame) = self.rx.recv().await {
            if let Some(message) = self.accept(&frame) {
                return Some(message);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Poll<M> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if let Some(message) = self.accept(&frame) {
                        return Poll::Ready(message);
                    }
                }
                Err(TryRecvError::Empty) => return Poll::Empty,
                Err(TryRecvError::Disconnected) => return Poll::Closed,
            }
        }
    }
}

pub fn channel<M: Serialize + DeserializeOwned>() -> (Outbox<M>, Inbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox::new(tx), Inbox::new(rx))
}
