//! Spectrum based suspiciousness formulas.
//!
//! Every formula maps the pass/fail counts of one statement and of the whole
//! run to a score, and returns `None` for statements no failing test
//! executed.

use crate::error::Result;
use crate::evidence::{pass_fail_stats_from_tests, FileResults, Stats};
use crate::faults::Fault;
use crate::messages::TestOutcome;
use clap::ValueEnum;
use glob::Pattern;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

pub fn dstar(local: &Stats, total: &Stats, exponent: f64) -> Option<f64> {
    if local.failed == 0 {
        return None;
    }
    let numerator = (local.failed as f64).powf(exponent);
    let denominator = local.passed as f64 + total.failed.saturating_sub(local.failed) as f64;
    if denominator == 0.0 {
        return Some(f64::INFINITY);
    }
    Some(numerator / denominator)
}

pub fn ochiai(local: &Stats, total: &Stats) -> Option<f64> {
    if local.failed == 0 {
        return None;
    }
    let denominator = (total.failed as f64 * local.executions() as f64).sqrt();
    if denominator == 0.0 {
        return None;
    }
    Some(local.failed as f64 / denominator)
}

pub fn tarantula(local: &Stats, total: &Stats) -> Option<f64> {
    if local.failed == 0 || total.failed == 0 {
        return None;
    }
    let failing_ratio = local.failed as f64 / total.failed as f64;
    let passing_ratio = if total.passed == 0 {
        0.0
    } else {
        local.passed as f64 / total.passed as f64
    };
    Some(failing_ratio / (failing_ratio + passing_ratio))
}

pub fn barinel(local: &Stats, _total: &Stats) -> Option<f64> {
    if local.failed == 0 {
        return None;
    }
    Some(1.0 - local.passed as f64 / local.executions() as f64)
}

pub fn op2(local: &Stats, total: &Stats) -> Option<f64> {
    if local.failed == 0 {
        return None;
    }
    Some(local.failed as f64 - local.passed as f64 / (total.passed as f64 + 1.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Formula {
    #[default]
    Dstar,
    Ochiai,
    Tarantula,
    Barinel,
    Op2,
}

impl Formula {
    pub const ALL: [Formula; 5] = [
        Formula::Dstar,
        Formula::Ochiai,
        Formula::Tarantula,
        Formula::Barinel,
        Formula::Op2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Formula::Dstar => "dstar",
            Formula::Ochiai => "ochiai",
            Formula::Tarantula => "tarantula",
            Formula::Barinel => "barinel",
            Formula::Op2 => "op2",
        }
    }

    /// `exponent` only affects dStar.
    pub fn score(&self, local: &Stats, total: &Stats, exponent: f64) -> Option<f64> {
        match self {
            Formula::Dstar => dstar(local, total, exponent),
            Formula::Ochiai => ochiai(local, total),
            Formula::Tarantula => tarantula(local, total),
            Formula::Barinel => barinel(local, total),
            Formula::Op2 => op2(local, total),
        }
    }

    pub fn scorer(self, exponent: f64) -> impl Fn(&Stats, &Stats) -> Option<f64> + Sync {
        move |local, total| self.score(local, total, exponent)
    }
}

/// Source files excluded from localization.
#[derive(Debug, Clone, Default)]
pub struct IgnoreGlobs {
    patterns: Vec<Pattern>,
}

impl IgnoreGlobs {
    pub fn new(globs: &[String]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| Pattern::new(g))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

/// Scores every statement of every file some test touched.
pub fn localize_faults<F>(
    outcomes: &[TestOutcome],
    file_results: &FileResults,
    ignore: &IgnoreGlobs,
    scoring: F,
) -> Vec<Fault>
where
    F: Fn(&Stats, &Stats) -> Option<f64> + Sync,
{
    let total = pass_fail_stats_from_tests(outcomes);
    let touched: BTreeSet<&String> = outcomes
        .iter()
        .flat_map(|outcome| outcome.coverage.keys())
        .filter(|path| {
            let ignored = ignore.is_ignored(path);
            if ignored {
                debug!("Ignoring {}", path);
            }
            !ignored
        })
        .collect();
    let touched: Vec<&String> = touched.into_iter().collect();

    touched
        .par_iter()
        .map(|path| match file_results.get(path.as_str()) {
            Some(file_result) => file_result
                .expressions
                .iter()
                .map(|expression| {
                    Fault::new(
                        expression.source_path.clone(),
                        expression.location,
                        scoring(&expression.stats, &total),
                    )
                })
                .collect::<Vec<_>>(),
            None => {
                debug!("No executed statements in {}", path);
                Vec::new()
            }
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::gather_file_results;
    use crate::evidence::tests::outcome;
    use proptest::prelude::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_dstar() {
        let total = Stats::new(3, 2);
        assert!(close(dstar(&Stats::new(1, 2), &total, 2.0), 4.0));
        assert!(close(dstar(&Stats::new(1, 1), &total, 2.0), 0.5));
        assert!(close(dstar(&Stats::new(1, 1), &total, 3.0), 0.5));
        assert_eq!(dstar(&Stats::new(0, 2), &total, 2.0), Some(f64::INFINITY));
    }

    #[test]
    fn test_ochiai() {
        let total = Stats::new(2, 4);
        assert!(close(ochiai(&Stats::new(0, 4), &total), 1.0));
        assert!(close(ochiai(&Stats::new(2, 2), &total), 2.0 / 16f64.sqrt()));
    }

    #[test]
    fn test_tarantula() {
        let total = Stats::new(4, 2);
        assert!(close(tarantula(&Stats::new(0, 2), &total), 1.0));
        assert!(close(tarantula(&Stats::new(2, 1), &total), 0.5));
        assert!(close(tarantula(&Stats::new(0, 1), &Stats::new(0, 2)), 1.0));
    }

    #[test]
    fn test_barinel_and_op2() {
        let total = Stats::new(3, 2);
        assert!(close(barinel(&Stats::new(1, 3), &total), 0.75));
        assert!(close(op2(&Stats::new(3, 2), &total), 2.0 - 3.0 / 4.0));
    }

    #[test]
    fn test_localize_faults_scores_touched_files() {
        let outcomes = vec![
            outcome("pass", true, &[("src/a.js", &[1, 1]), ("vendor/lib.js", &[1])]),
            outcome("fail", false, &[("src/a.js", &[0, 1]), ("vendor/lib.js", &[1])]),
        ];
        let file_results = gather_file_results(&outcomes);
        let ignore = IgnoreGlobs::new(&["vendor/**".to_string()]).unwrap();

        let faults = localize_faults(
            &outcomes,
            &file_results,
            &ignore,
            Formula::Dstar.scorer(2.0),
        );

        assert_eq!(faults.len(), 2);
        assert!(faults.iter().all(|f| f.source_path == "src/a.js"));
        assert_eq!(faults[0].score, None);
        assert!(close(faults[1].score, 1.0));
    }

    #[test]
    fn test_localize_faults_skips_files_without_evidence() {
        let outcomes = vec![outcome("fail", false, &[("src/a.js", &[1])])];
        let faults = localize_faults(
            &outcomes,
            &FileResults::new(),
            &IgnoreGlobs::default(),
            Formula::Ochiai.scorer(2.0),
        );
        assert!(faults.is_empty());
    }

    #[test]
    fn test_invalid_ignore_glob() {
        assert!(IgnoreGlobs::new(&["src/[".to_string()]).is_err());
    }

    proptest! {
        #[test]
        fn prop_never_failing_statement_is_not_scored(
            passed in 0u64..100,
            total_passed in 0u64..100,
            total_failed in 0u64..100,
            exponent in 1.0f64..4.0,
        ) {
            let local = Stats::new(passed, 0);
            let total = Stats::new(total_passed + passed, total_failed);
            for formula in Formula::ALL {
                prop_assert_eq!(formula.score(&local, &total, exponent), None);
            }
        }

        #[test]
        fn prop_scores_are_never_nan(
            passed in 0u64..50,
            failed in 1u64..50,
            extra_passed in 0u64..50,
            extra_failed in 0u64..50,
        ) {
            let local = Stats::new(passed, failed);
            let total = Stats::new(passed + extra_passed, failed + extra_failed);
            for formula in Formula::ALL {
                let score = formula.score(&local, &total, 2.0);
                prop_assert!(score.map_or(true, |s| !s.is_nan()));
            }
        }
    }
}
