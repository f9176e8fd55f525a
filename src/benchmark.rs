use crate::coverage::{total_executable_statements, CoverageSnapshot};
use crate::error::Result;
use crate::evidence::gather_file_results;
use crate::faults::{sort_by_suspiciousness, Fault};
use crate::messages::TestOutcome;
use crate::sbfl::{localize_faults, Formula, IgnoreGlobs};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

pub fn fault_key(fault: &Fault) -> String {
    format!(
        "{}:{}:{}",
        fault.source_path, fault.location.start.line, fault.location.start.column
    )
}

/// EXAM score of a ranked fault list: the average rank at which each
/// expected fault is found, as a fraction of the program's statements.
/// Lower is better. `None` when there is nothing to score against.
pub fn calculate_exam_score(
    actual_faults: &[Fault],
    expected_faults: &[Fault],
    total_executable_statements: usize,
) -> Option<f64> {
    if expected_faults.is_empty() || total_executable_statements == 0 {
        return None;
    }

    let mut remaining: HashSet<String> = expected_faults.iter().map(fault_key).collect();
    let mut sum = 0usize;
    // The first fault still costs one line
    let mut lines_inspected = 1usize;

    for fault in actual_faults {
        if remaining.remove(&fault_key(fault)) {
            sum += lines_inspected;
        } else {
            lines_inspected += 1;
        }
    }

    Some(sum as f64 / expected_faults.len() as f64 / total_executable_statements as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub name: String,
    pub date: String,
    pub total_executable_statements: usize,
    /// Formula name -> EXAM score.
    pub scores: BTreeMap<String, Option<f64>>,
}

/// Scores every built-in formula on the same evidence.
pub fn run_benchmark(
    name: &str,
    outcomes: &[TestOutcome],
    expected_faults: &[Fault],
    coverage: &CoverageSnapshot,
    dstar_exponent: f64,
    ignore: &IgnoreGlobs,
) -> BenchmarkReport {
    let now: DateTime<Local> = Local::now();
    let file_results = gather_file_results(outcomes);
    let total = total_executable_statements(coverage);

    let mut scores = BTreeMap::new();
    for formula in Formula::ALL {
        let mut faults = localize_faults(
            outcomes,
            &file_results,
            ignore,
            formula.scorer(dstar_exponent),
        );
        sort_by_suspiciousness(&mut faults);
        let score = calculate_exam_score(&faults, expected_faults, total);
        info!("{}: {:?}", formula.name(), score);
        scores.insert(formula.name().to_string(), score);
    }

    BenchmarkReport {
        name: name.to_string(),
        date: now.format("%d/%m/%Y %H:%M:%S").to_string(),
        total_executable_statements: total,
        scores,
    }
}

/// Appends `report` to the JSON array stored at `path`.
pub fn save_report(report: &BenchmarkReport, path: &Path) -> Result<()> {
    let final_data = if path.exists() {
        let existing_content = fs::read_to_string(path)?;
        let mut existing_data: serde_json::Value = serde_json::from_str(&existing_content)?;

        match existing_data {
            serde_json::Value::Array(ref mut arr) => {
                arr.push(serde_json::to_value(report)?);
                existing_data
            }
            _ => serde_json::json!([existing_data, report]),
        }
    } else {
        serde_json::json!([report])
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&final_data)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::tests::file_with_counts;
    use crate::coverage::ExpressionSpan;
    use crate::evidence::tests::outcome;
    use tempfile::TempDir;

    fn fault(line: u32, column: u32) -> Fault {
        Fault::new("a", ExpressionSpan::new((line, column), (1, 1)), None)
    }

    #[test]
    fn test_exact_match() {
        let faults = vec![fault(1, 1), fault(2, 2)];
        assert_eq!(calculate_exam_score(&faults, &faults, 2), Some(0.5));
    }

    #[test]
    fn test_misses_cost_lines() {
        let expected = vec![fault(3, 0)];
        let actual = vec![fault(1, 0), fault(2, 0), fault(3, 0)];
        assert_eq!(calculate_exam_score(&actual, &expected, 10), Some(0.3));
        assert_eq!(calculate_exam_score(&actual, &[], 10), None);
        assert_eq!(calculate_exam_score(&actual, &expected, 0), None);
    }

    #[test]
    fn test_duplicates_match_once() {
        let expected = vec![fault(1, 0)];
        let actual = vec![fault(1, 0), fault(1, 0)];
        assert_eq!(calculate_exam_score(&actual, &expected, 1), Some(1.0));
    }

    #[test]
    fn test_run_benchmark_scores_every_formula() {
        let outcomes = vec![
            outcome("pass", true, &[("src/a.js", &[1, 0, 1])]),
            outcome("fail", false, &[("src/a.js", &[1, 1, 0])]),
        ];
        let coverage: CoverageSnapshot =
            [("src/a.js".to_string(), file_with_counts("src/a.js", &[2, 1, 1]))].into();
        let expected = vec![Fault::new(
            "src/a.js",
            ExpressionSpan::new((2, 0), (2, 10)),
            None,
        )];

        let report = run_benchmark(
            "demo",
            &outcomes,
            &expected,
            &coverage,
            2.0,
            &IgnoreGlobs::default(),
        );

        assert_eq!(report.total_executable_statements, 3);
        assert_eq!(report.scores.len(), Formula::ALL.len());
        assert_eq!(report.scores["dstar"], Some(1.0 / 3.0));
        assert_eq!(report.scores["ochiai"], Some(1.0 / 3.0));
    }

    #[test]
    fn test_save_report_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports/benchmark.json");
        let report = BenchmarkReport {
            name: "demo".to_string(),
            date: "01/01/2024 12:00:00".to_string(),
            total_executable_statements: 3,
            scores: [("dstar".to_string(), Some(0.25))].into(),
        };

        save_report(&report, &path).unwrap();
        save_report(&report, &path).unwrap();

        let saved: Vec<BenchmarkReport> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, vec![report.clone(), report]);
    }
}
