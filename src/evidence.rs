use crate::coverage::ExpressionSpan;
use crate::messages::TestOutcome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stats {
    pub passed: u64,
    pub failed: u64,
}

impl Stats {
    pub fn new(passed: u64, failed: u64) -> Self {
        Self { passed, failed }
    }

    pub fn record(&mut self, passed: bool) {
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn executions(&self) -> u64 {
        self.passed + self.failed
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, other: Stats) -> Stats {
        Stats {
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Stats) {
        *self = *self + other;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionResult {
    pub source_path: String,
    pub location: ExpressionSpan,
    pub stats: Stats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub source_path: String,
    pub expressions: Vec<ExpressionResult>,
}

pub type FileResults = BTreeMap<String, FileResult>;

/// Identity of a statement across every test's coverage.
pub fn expression_key(source_path: &str, location: &ExpressionSpan) -> String {
    format!(
        "{}:{}:{}|{}:{}",
        source_path,
        location.start.line,
        location.start.column,
        location.end.line,
        location.end.column
    )
}

/// Aggregates how many passing and failing tests executed each statement.
///
/// Every statement of a touched file gets an entry; only tests that actually
/// executed it (`s > 0`) count towards its stats.
pub fn gather_file_results<'a, I>(outcomes: I) -> FileResults
where
    I: IntoIterator<Item = &'a TestOutcome>,
{
    let mut expressions: HashMap<String, ExpressionResult> = HashMap::new();

    for outcome in outcomes {
        for (source_path, file_coverage) in &outcome.coverage {
            for (statement_id, location) in &file_coverage.statement_map {
                let entry = expressions
                    .entry(expression_key(source_path, location))
                    .or_insert_with(|| ExpressionResult {
                        source_path: source_path.clone(),
                        location: *location,
                        stats: Stats::default(),
                    });
                if file_coverage.statement_count(statement_id) > 0 {
                    entry.stats.record(outcome.passed);
                }
            }
        }
    }

    let mut file_results = FileResults::new();
    for expression in expressions.into_values() {
        file_results
            .entry(expression.source_path.clone())
            .or_insert_with(|| FileResult {
                source_path: expression.source_path.clone(),
                expressions: Vec::new(),
            })
            .expressions
            .push(expression);
    }
    for file_result in file_results.values_mut() {
        file_result.expressions.sort_by_key(|e| e.location);
    }
    file_results
}

/// Drops statements no test executed, and files left without any.
pub fn filter_out_unexecuted(file_results: FileResults) -> FileResults {
    file_results
        .into_iter()
        .filter_map(|(path, mut file_result)| {
            file_result
                .expressions
                .retain(|expression| expression.stats.executions() > 0);
            (!file_result.expressions.is_empty()).then_some((path, file_result))
        })
        .collect()
}

/// Passing and failing test totals across a run.
pub fn pass_fail_stats_from_tests<'a, I>(outcomes: I) -> Stats
where
    I: IntoIterator<Item = &'a TestOutcome>,
{
    let mut stats = Stats::default();
    for outcome in outcomes {
        stats.record(outcome.passed);
    }
    stats
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coverage::tests::file_with_counts;
    use crate::coverage::CoverageSnapshot;
    use proptest::prelude::*;

    pub(crate) fn outcome(name: &str, passed: bool, files: &[(&str, &[i64])]) -> TestOutcome {
        let coverage: CoverageSnapshot = files
            .iter()
            .map(|(path, counts)| (path.to_string(), file_with_counts(path, counts)))
            .collect();
        TestOutcome {
            key: name.to_string(),
            title_path: vec![name.to_string()],
            file: format!("test/{}.test.js", name),
            passed,
            duration_ms: 1.0,
            coverage,
            stack: None,
        }
    }

    fn stats_at(results: &FileResults, path: &str, line: u32) -> Stats {
        results[path]
            .expressions
            .iter()
            .find(|e| e.location.start.line == line)
            .map(|e| e.stats)
            .unwrap()
    }

    #[test]
    fn test_gather_counts_only_executed_statements() {
        let outcomes = vec![
            outcome("a", true, &[("src/a.js", &[1, 0, 3])]),
            outcome("b", false, &[("src/a.js", &[2, 1, 0])]),
            outcome("c", false, &[("src/a.js", &[0, 1, 0]), ("src/b.js", &[1])]),
        ];
        let results = gather_file_results(&outcomes);

        assert_eq!(results.len(), 2);
        assert_eq!(stats_at(&results, "src/a.js", 1), Stats::new(1, 1));
        assert_eq!(stats_at(&results, "src/a.js", 2), Stats::new(0, 2));
        assert_eq!(stats_at(&results, "src/a.js", 3), Stats::new(1, 0));
        assert_eq!(stats_at(&results, "src/b.js", 1), Stats::new(0, 1));
    }

    #[test]
    fn test_filter_out_unexecuted() {
        let outcomes = vec![outcome("a", true, &[("src/a.js", &[1, 0])])];
        let results = gather_file_results(&outcomes);
        assert_eq!(results["src/a.js"].expressions.len(), 2);

        let filtered = filter_out_unexecuted(results);
        assert_eq!(filtered["src/a.js"].expressions.len(), 1);
        assert_eq!(filtered["src/a.js"].expressions[0].location.start.line, 1);
    }

    #[test]
    fn test_filter_out_unexecuted_drops_empty_files() {
        let outcomes = vec![
            outcome("a", true, &[("src/a.js", &[1]), ("src/b.js", &[0, 0])]),
            outcome("b", false, &[("src/b.js", &[0, 0])]),
        ];
        let results = gather_file_results(&outcomes);
        assert_eq!(results["src/b.js"].expressions.len(), 2);

        let filtered = filter_out_unexecuted(results);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("src/a.js"));
        assert!(!filtered.contains_key("src/b.js"));
    }

    #[test]
    fn test_pass_fail_stats() {
        let outcomes = vec![
            outcome("a", true, &[]),
            outcome("b", false, &[]),
            outcome("c", false, &[]),
        ];
        assert_eq!(pass_fail_stats_from_tests(&outcomes), Stats::new(1, 2));
    }

    #[test]
    fn test_expression_key() {
        let span = ExpressionSpan::new((3, 4), (5, 6));
        assert_eq!(expression_key("src/a.js", &span), "src/a.js:3:4|5:6");
    }

    fn arb_outcomes() -> impl Strategy<Value = Vec<TestOutcome>> {
        prop::collection::vec(
            (
                any::<bool>(),
                prop::collection::vec(0i64..3, 0..5),
                prop::collection::vec(0i64..3, 0..3),
            ),
            0..8,
        )
        .prop_map(|tests| {
            tests
                .into_iter()
                .enumerate()
                .map(|(i, (passed, a, b))| {
                    outcome(
                        &format!("t{}", i),
                        passed,
                        &[("src/a.js", a.as_slice()), ("src/b.js", b.as_slice())],
                    )
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_gather_is_order_independent(
            (outcomes, shuffled) in arb_outcomes()
                .prop_flat_map(|o| (Just(o.clone()), Just(o).prop_shuffle()))
        ) {
            prop_assert_eq!(gather_file_results(&outcomes), gather_file_results(&shuffled));
        }

        #[test]
        fn prop_gather_is_associative(outcomes in arb_outcomes(), split in 0usize..8) {
            let split = split.min(outcomes.len());
            let whole = gather_file_results(&outcomes);
            let left = gather_file_results(&outcomes[..split]);
            let right = gather_file_results(&outcomes[split..]);

            for (path, file_result) in &whole {
                for expression in &file_result.expressions {
                    let part = |results: &FileResults| {
                        results
                            .get(path)
                            .and_then(|f| f.expressions.iter().find(|e| e.location == expression.location))
                            .map(|e| e.stats)
                            .unwrap_or_default()
                    };
                    prop_assert_eq!(part(&left) + part(&right), expression.stats);
                }
            }
        }
    }
}
