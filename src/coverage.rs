use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// Start/end of a statement or expression within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpressionSpan {
    pub start: SourceLocation,
    pub end: SourceLocation,
}

impl ExpressionSpan {
    pub fn new(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: SourceLocation {
                line: start.0,
                column: start.1,
            },
            end: SourceLocation {
                line: end.0,
                column: end.1,
            },
        }
    }

    pub fn contains(&self, other: &ExpressionSpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

pub type Counters = BTreeMap<String, i64>;
pub type BranchCounters = BTreeMap<String, Vec<i64>>;

/// Istanbul-shaped coverage of a single file. Only `statement_map` and the
/// counters are interpreted; every other field is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub statement_map: BTreeMap<String, ExpressionSpan>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fn_map: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub branch_map: Value,
    #[serde(default)]
    pub s: Counters,
    #[serde(default)]
    pub f: Counters,
    #[serde(default)]
    pub b: BranchCounters,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FileCoverage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Execution count of a statement. Statements the instrumentor mapped but
    /// never counted read as zero.
    pub fn statement_count(&self, statement_id: &str) -> i64 {
        self.s.get(statement_id).copied().unwrap_or(0)
    }

    fn has_nonzero_counts(&self) -> bool {
        self.s.values().any(|&v| v != 0)
            || self.f.values().any(|&v| v != 0)
            || self.b.values().any(|arr| arr.iter().any(|&v| v != 0))
    }
}

/// File path -> coverage, as produced by the instrumentor.
pub type CoverageSnapshot = BTreeMap<String, FileCoverage>;

pub fn diff_counters(from: &Counters, amount: &Counters) -> Counters {
    from.iter()
        .map(|(key, value)| (key.clone(), value - amount.get(key).copied().unwrap_or(0)))
        .collect()
}

pub fn diff_branch_counters(from: &BranchCounters, amount: &BranchCounters) -> BranchCounters {
    from.iter()
        .map(|(key, from_branch)| {
            let amount_branch = amount.get(key);
            let branch = from_branch
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    value - amount_branch.and_then(|b| b.get(i)).copied().unwrap_or(0)
                })
                .collect();
            (key.clone(), branch)
        })
        .collect()
}

/// Coverage accumulated in `from` since `amount` was taken.
///
/// Files that `amount` has never seen are copied verbatim. Files whose
/// statement, function and branch counters all diff to zero are dropped, which
/// is how a test that never touched a file is told apart from one that did.
/// Negative differences are kept as-is.
pub fn subtract_coverage(
    from: &CoverageSnapshot,
    amount: Option<&CoverageSnapshot>,
) -> CoverageSnapshot {
    let amount = match amount {
        Some(amount) => amount,
        None => return from.clone(),
    };

    let mut diff = CoverageSnapshot::new();
    for (file_path, file_coverage) in from {
        let before = match amount.get(file_path) {
            Some(before) => before,
            None => {
                diff.insert(file_path.clone(), file_coverage.clone());
                continue;
            }
        };

        let file_diff = FileCoverage {
            path: file_coverage.path.clone(),
            statement_map: file_coverage.statement_map.clone(),
            fn_map: file_coverage.fn_map.clone(),
            branch_map: file_coverage.branch_map.clone(),
            s: diff_counters(&file_coverage.s, &before.s),
            f: diff_counters(&file_coverage.f, &before.f),
            b: diff_branch_counters(&file_coverage.b, &before.b),
            extra: file_coverage.extra.clone(),
        };

        if file_diff.has_nonzero_counts() {
            diff.insert(file_path.clone(), file_diff);
        }
    }
    diff
}

/// Adds the counters of `other` onto `into`.
pub fn merge_coverage(into: &mut CoverageSnapshot, other: &CoverageSnapshot) {
    for (file_path, file_coverage) in other {
        match into.get_mut(file_path) {
            None => {
                into.insert(file_path.clone(), file_coverage.clone());
            }
            Some(existing) => {
                for (id, span) in &file_coverage.statement_map {
                    existing.statement_map.entry(id.clone()).or_insert(*span);
                }
                for (id, count) in &file_coverage.s {
                    *existing.s.entry(id.clone()).or_insert(0) += count;
                }
                for (id, count) in &file_coverage.f {
                    *existing.f.entry(id.clone()).or_insert(0) += count;
                }
                for (id, counts) in &file_coverage.b {
                    let branch = existing.b.entry(id.clone()).or_default();
                    if branch.len() < counts.len() {
                        branch.resize(counts.len(), 0);
                    }
                    for (i, count) in counts.iter().enumerate() {
                        branch[i] += count;
                    }
                }
            }
        }
    }
}

/// Number of statements executed at least once across all files.
pub fn total_executable_statements(coverage: &CoverageSnapshot) -> usize {
    coverage
        .values()
        .map(|file| file.s.values().filter(|&&count| count > 0).count())
        .sum()
}

pub fn read_coverage_file(coverage_file_path: &Path) -> Result<CoverageSnapshot> {
    let content = fs::read_to_string(coverage_file_path)?;
    let coverage: CoverageSnapshot = serde_json::from_str(&content)?;
    Ok(coverage)
}

/// Coverage counters owned by one worker's execution context.
///
/// Instrumented code bumps counters through the `hit_*` methods; the worker
/// harness takes a `snapshot` before each test and asks for `diff_since` once
/// the test completes. Nothing else mutates the counters, so the pair of
/// calls attributes exactly one test's executions.
#[derive(Debug, Clone, Default)]
pub struct CoverageStore {
    data: CoverageSnapshot,
}

impl CoverageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coverage(data: CoverageSnapshot) -> Self {
        Self { data }
    }

    /// Registers a freshly instrumented file. Files that are already known
    /// keep their counters.
    pub fn register_file(&mut self, file: FileCoverage) {
        self.data.entry(file.path.clone()).or_insert(file);
    }

    fn file_mut(&mut self, path: &str) -> &mut FileCoverage {
        self.data
            .entry(path.to_string())
            .or_insert_with(|| FileCoverage::new(path))
    }

    pub fn hit_statement(&mut self, path: &str, statement_id: &str) {
        *self
            .file_mut(path)
            .s
            .entry(statement_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn hit_function(&mut self, path: &str, function_id: &str) {
        *self
            .file_mut(path)
            .f
            .entry(function_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn hit_branch(&mut self, path: &str, branch_id: &str, index: usize) {
        let branch = self
            .file_mut(path)
            .b
            .entry(branch_id.to_string())
            .or_default();
        if branch.len() <= index {
            branch.resize(index + 1, 0);
        }
        branch[index] += 1;
    }

    /// Resets every counter, the way a reloaded instrumentor would.
    pub fn reset_counters(&mut self) {
        for file in self.data.values_mut() {
            file.s.values_mut().for_each(|v| *v = 0);
            file.f.values_mut().for_each(|v| *v = 0);
            file.b
                .values_mut()
                .for_each(|arr| arr.iter_mut().for_each(|v| *v = 0));
        }
    }

    pub fn snapshot(&self) -> CoverageSnapshot {
        self.data.clone()
    }

    pub fn diff_since(&self, before: &CoverageSnapshot) -> CoverageSnapshot {
        subtract_coverage(&self.data, Some(before))
    }

    pub fn data(&self) -> &CoverageSnapshot {
        &self.data
    }

    pub fn into_inner(self) -> CoverageSnapshot {
        self.data
    }
}
