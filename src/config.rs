use crate::error::Result;
use crate::sbfl::Formula;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a worker hosts the test framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// Fresh framework instance per test file; queued files drain LIFO.
    Sandbox,
    /// Every queued file in one instance, alphabetical order.
    #[default]
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MutationStrategy {
    /// One instruction per trial.
    #[default]
    Single,
    /// Greedy blocks of non-conflicting instructions per trial.
    Grouped,
}

/// Root configuration, read from a JSON file and then overridden by flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub runner: RunnerConfig,
    pub sbfl: SbflConfig,
    pub mutation: MutationConfig,
    pub fault_file: PathBuf,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            sbfl: SbflConfig::default(),
            mutation: MutationConfig::default(),
            fault_file: PathBuf::from("./faults/faults.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub workers: usize,
    pub mode: RunnerMode,
    /// Files handed to a worker ahead of the one it is running.
    pub file_buffer_count: usize,
    /// Longest a busy worker may stay silent.
    pub timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            mode: RunnerMode::Batch,
            file_buffer_count: 4,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SbflConfig {
    pub formula: Formula,
    pub dstar_exponent: f64,
    pub ignore_globs: Vec<String>,
}

impl Default for SbflConfig {
    fn default() -> Self {
        Self {
            formula: Formula::Dstar,
            dstar_exponent: 2.0,
            ignore_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub strategy: MutationStrategy,
    pub max_trials: Option<usize>,
}

impl FaultConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
