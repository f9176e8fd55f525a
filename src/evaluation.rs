use crate::coverage::ExpressionSpan;
use crate::error::Result;
use crate::faults::Fault;
use crate::messages::TestOutcome;
use crate::operators::InstructionKind;
use crate::runner::TesterResults;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Reads V8 (`at fn (file:1:2)`) and Firefox (`fn@file:1:2`) stack frames.
pub struct StackParser {
    v8: Regex,
    firefox: Regex,
}

impl StackParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            v8: Regex::new(r"^\s*at (?:.*? \()?(?P<file>.+?):(?P<line>\d+):(?P<column>\d+)\)?\s*$")?,
            firefox: Regex::new(r"^[^@\s]*@(?P<file>.+?):(?P<line>\d+):(?P<column>\d+)\s*$")?,
        })
    }

    pub fn parse(&self, stack: &str) -> Vec<StackFrame> {
        stack
            .lines()
            .filter_map(|line| {
                let captures = self
                    .v8
                    .captures(line)
                    .or_else(|| self.firefox.captures(line))?;
                Some(StackFrame {
                    file: captures["file"].to_string(),
                    line: captures["line"].parse().ok()?,
                    column: captures["column"].parse().ok()?,
                })
            })
            .collect()
    }

    /// First frame that points into `test_file`.
    pub fn frame_in_file(&self, stack: &str, test_file: &str) -> Option<StackFrame> {
        let relative = test_file.trim_start_matches("./");
        self.parse(stack).into_iter().find(|frame| {
            frame.file == test_file
                || frame.file == relative
                || frame.file.ends_with(&format!("/{}", relative))
        })
    }
}

/// Error type and message, without the frames.
fn error_signature(stack: &str) -> &str {
    stack.lines().next().unwrap_or("").trim()
}

/// How one test reacted to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestEvaluation {
    /// 1 when the test now passes, -1 when it now fails, 0 otherwise.
    pub end_result_improvement: i64,
    pub stack_line_score: Option<i64>,
    pub stack_column_score: Option<i64>,
    pub error_changed: bool,
}

pub fn evaluate_modified_test(
    parser: &StackParser,
    original: &TestOutcome,
    modified: &TestOutcome,
) -> TestEvaluation {
    let end_result_improvement = match (original.passed, modified.passed) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    };

    let (stack_line_score, stack_column_score) = match (&original.stack, &modified.stack) {
        (Some(old_stack), Some(new_stack)) if !original.passed && !modified.passed => {
            match (
                parser.frame_in_file(old_stack, &original.file),
                parser.frame_in_file(new_stack, &modified.file),
            ) {
                (Some(old), Some(new)) => (
                    Some(new.line as i64 - old.line as i64),
                    Some(new.column as i64 - old.column as i64),
                ),
                _ => (None, None),
            }
        }
        _ => (None, None),
    };

    let error_changed = match (original.passed, modified.passed) {
        (true, true) => false,
        (false, false) => {
            let old = original.stack.as_deref().map(error_signature);
            let new = modified.stack.as_deref().map(error_signature);
            old != new
        }
        _ => true,
    };

    TestEvaluation {
        end_result_improvement,
        stack_line_score,
        stack_column_score,
        error_changed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub end_result_improvement: i64,
    pub stack_line_score: Option<i64>,
    pub stack_column_score: Option<i64>,
    pub error_changed: bool,
}

/// Folds the per-test reactions of one trial. Tests missing from either run
/// are not compared.
pub fn evaluate_trial(
    parser: &StackParser,
    original: &TesterResults,
    modified: &TesterResults,
) -> EvaluationResult {
    let mut result = EvaluationResult::default();
    for (key, new_outcome) in &modified.test_results {
        let old_outcome = match original.test_results.get(key) {
            Some(outcome) => outcome,
            None => continue,
        };
        let evaluation = evaluate_modified_test(parser, old_outcome, new_outcome);
        result.end_result_improvement += evaluation.end_result_improvement;
        result.error_changed |= evaluation.error_changed;
        if let Some(line) = evaluation.stack_line_score {
            result.stack_line_score = Some(result.stack_line_score.unwrap_or(0) + line);
            if line == 0 {
                if let Some(column) = evaluation.stack_column_score {
                    result.stack_column_score =
                        Some(result.stack_column_score.unwrap_or(0) + column);
                }
            }
        }
    }
    result
}

/// Ascending order; the most promising evaluation compares greatest.
///
/// Keys, in order: end result improvement, stack line score, stack column
/// score (a missing score sorts before any number), then whether the error
/// changed.
pub fn compare_evaluations(a: &EvaluationResult, b: &EvaluationResult) -> Ordering {
    a.end_result_improvement
        .cmp(&b.end_result_improvement)
        .then_with(|| a.stack_line_score.cmp(&b.stack_line_score))
        .then_with(|| a.stack_column_score.cmp(&b.stack_column_score))
        .then_with(|| a.error_changed.cmp(&b.error_changed))
}

/// Stable sort, best evaluation last.
pub fn sort_expression_evaluations(results: &mut [EvaluationResult]) {
    results.sort_by(compare_evaluations);
}

/// A node changed during a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutatedLocation {
    pub file_path: String,
    pub location: ExpressionSpan,
    pub kind: InstructionKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvaluation {
    pub mutations: Vec<MutatedLocation>,
    pub result: EvaluationResult,
}

/// Turns ranked trials into faults: best trial first, every location once,
/// scores counting down from the number of locations.
pub fn mutation_evaluations_to_faults(mut evaluations: Vec<MutationEvaluation>) -> Vec<Fault> {
    evaluations.sort_by(|a, b| compare_evaluations(&a.result, &b.result));

    let mut seen = HashSet::new();
    let mut ranked: Vec<(&MutatedLocation, &EvaluationResult)> = Vec::new();
    for evaluation in evaluations.iter().rev() {
        for mutation in &evaluation.mutations {
            let key = format!(
                "{}:{}:{}",
                mutation.file_path, mutation.location.start.line, mutation.location.start.column
            );
            if seen.insert(key) {
                ranked.push((mutation, &evaluation.result));
            }
        }
    }

    let total = ranked.len();
    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (mutation, result))| {
            let mut other = Map::new();
            other.insert(
                "mutation".to_string(),
                Value::String(mutation.kind.name().to_string()),
            );
            other.insert(
                "description".to_string(),
                Value::String(mutation.description.clone()),
            );
            if let Ok(result) = serde_json::to_value(result) {
                other.insert("evaluation".to_string(), result);
            }
            let mut fault = Fault::new(
                mutation.file_path.clone(),
                mutation.location,
                Some((total - rank) as f64),
            );
            fault.other = Some(other);
            fault
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::tests::outcome;

    fn e(
        end_result_improvement: i64,
        stack_line_score: Option<i64>,
        stack_column_score: Option<i64>,
        error_changed: bool,
    ) -> EvaluationResult {
        EvaluationResult {
            end_result_improvement,
            stack_line_score,
            stack_column_score,
            error_changed,
        }
    }

    /// e1..e28 in their expected order.
    fn ranked_fixture() -> Vec<EvaluationResult> {
        let signals = [
            (None, None, false),
            (None, None, true),
            (Some(0), None, false),
            (Some(0), None, true),
            (Some(0), Some(0), false),
            (Some(0), Some(0), true),
            (Some(0), Some(1), false),
            (Some(0), Some(1), true),
            (Some(1), None, false),
            (Some(1), None, true),
            (Some(1), Some(0), false),
            (Some(1), Some(0), true),
            (Some(1), Some(1), false),
            (Some(1), Some(1), true),
        ];
        (0..2)
            .flat_map(|improvement| {
                signals
                    .iter()
                    .map(move |(line, column, changed)| e(improvement, *line, *column, *changed))
            })
            .collect()
    }

    #[test]
    fn test_sort_expression_evaluations_fixture() {
        let expected = ranked_fixture();
        let order = [
            5, 4, 3, 2, 1, 6, 7, 8, 10, 9, 11, 15, 14, 13, 12, 20, 19, 18, 17, 16, 28, 27, 26, 25,
            22, 21, 24, 23,
        ];
        let mut shuffled: Vec<EvaluationResult> =
            order.iter().map(|n| expected[n - 1]).collect();

        sort_expression_evaluations(&mut shuffled);

        assert_eq!(shuffled, expected);
    }

    #[test]
    fn test_parse_v8_and_firefox_frames() {
        let parser = StackParser::new().unwrap();
        let stack = "TypeError: x is not a function\n    at add (/repo/src/add.js:2:10)\n    at Context.<anonymous> (/repo/test/add.test.js:5:3)\n    at /repo/node_modules/mocha/runner.js:1:1\nadd@/repo/src/add.js:7:8";
        let frames = parser.parse(stack);
        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[1],
            StackFrame {
                file: "/repo/test/add.test.js".to_string(),
                line: 5,
                column: 3
            }
        );
        assert_eq!(frames[2].file, "/repo/node_modules/mocha/runner.js");
        assert_eq!(frames[3].line, 7);

        let frame = parser.frame_in_file(stack, "./test/add.test.js").unwrap();
        assert_eq!((frame.line, frame.column), (5, 3));
        assert!(parser.frame_in_file(stack, "test/other.test.js").is_none());
    }

    fn failing(name: &str, stack: &str) -> TestOutcome {
        let mut result = outcome(name, false, &[]);
        result.stack = Some(stack.to_string());
        result
    }

    #[test]
    fn test_evaluate_modified_test() {
        let parser = StackParser::new().unwrap();
        let old = failing("adds", "AssertionError: 3 == 4\n    at test/adds.test.js:4:10");

        let fixed = outcome("adds", true, &[]);
        let evaluation = evaluate_modified_test(&parser, &old, &fixed);
        assert_eq!(evaluation.end_result_improvement, 1);
        assert!(evaluation.error_changed);
        assert_eq!(evaluation.stack_line_score, None);

        let later = failing("adds", "AssertionError: 3 == 4\n    at test/adds.test.js:6:2");
        let evaluation = evaluate_modified_test(&parser, &old, &later);
        assert_eq!(evaluation.end_result_improvement, 0);
        assert!(!evaluation.error_changed);
        assert_eq!(evaluation.stack_line_score, Some(2));
        assert_eq!(evaluation.stack_column_score, Some(-8));

        let other_error = failing("adds", "TypeError: boom\n    at src/add.js:1:1");
        let evaluation = evaluate_modified_test(&parser, &old, &other_error);
        assert!(evaluation.error_changed);
        assert_eq!(evaluation.stack_line_score, None);

        let broken = evaluate_modified_test(&parser, &fixed, &old);
        assert_eq!(broken.end_result_improvement, -1);
    }

    #[test]
    fn test_evaluate_trial_sums_signals() {
        let parser = StackParser::new().unwrap();
        let original = TesterResults::from_outcomes(vec![
            failing("a", "Error: a\n    at test/a.test.js:4:10"),
            failing("b", "Error: b\n    at test/b.test.js:4:10"),
            outcome("c", true, &[]),
        ]);
        let modified = TesterResults::from_outcomes(vec![
            outcome("a", true, &[]),
            failing("b", "Error: b\n    at test/b.test.js:4:14"),
            failing("c", "Error: c\n    at test/c.test.js:1:1"),
            outcome("new", true, &[]),
        ]);
        let result = evaluate_trial(&parser, &original, &modified);
        assert_eq!(result, e(0, Some(0), Some(4), true));
    }

    fn evaluation(line: u32, result: EvaluationResult) -> MutationEvaluation {
        MutationEvaluation {
            mutations: vec![MutatedLocation {
                file_path: "src/add.js".to_string(),
                location: ExpressionSpan::new((line, 0), (line, 4)),
                kind: InstructionKind::ChangeBinaryOperator,
                description: "- -> +".to_string(),
            }],
            result,
        }
    }

    #[test]
    fn test_mutation_evaluations_to_faults() {
        let faults = mutation_evaluations_to_faults(vec![
            evaluation(1, e(0, None, None, false)),
            evaluation(2, e(1, None, None, true)),
            evaluation(2, e(0, Some(3), None, false)),
            evaluation(3, e(0, Some(1), None, false)),
        ]);
        let lines: Vec<u32> = faults.iter().map(|f| f.location.start.line).collect();
        assert_eq!(lines, vec![2, 3, 1]);
        let scores: Vec<Option<f64>> = faults.iter().map(|f| f.score).collect();
        assert_eq!(scores, vec![Some(3.0), Some(2.0), Some(1.0)]);
        let other = faults[0].other.as_ref().unwrap();
        assert_eq!(other["mutation"], "change-binary-operator");
        assert_eq!(other["evaluation"]["endResultImprovement"], 1);
    }
}
