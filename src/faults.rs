use crate::coverage::ExpressionSpan;
use crate::error::{FaultError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A suspicious location. `score` is `None` when the formula could not
/// compute one, and such faults rank below every scored one.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub source_path: String,
    pub location: ExpressionSpan,
    pub score: Option<f64>,
    pub other: Option<Map<String, Value>>,
}

impl Fault {
    pub fn new(
        source_path: impl Into<String>,
        location: ExpressionSpan,
        score: Option<f64>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            location,
            score,
            other: None,
        }
    }
}

pub fn compare_location(a: &ExpressionSpan, b: &ExpressionSpan) -> Ordering {
    a.start
        .line
        .cmp(&b.start.line)
        .then(a.start.column.cmp(&b.start.column))
        .then(a.end.line.cmp(&b.end.line))
        .then(a.end.column.cmp(&b.end.column))
}

/// Most suspicious first: `+inf`, finite scores, `-inf`, then `None`.
pub fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_by_suspiciousness(faults: &mut [Fault]) {
    faults.sort_by(|a, b| {
        compare_scores(a.score, b.score)
            .then_with(|| a.source_path.cmp(&b.source_path))
            .then_with(|| compare_location(&a.location, &b.location))
    });
}

// Infinite scores are written as `true` (+inf) and `false` (-inf).
mod sentinel {
    use super::*;

    pub fn serialize<S: Serializer>(
        score: &Option<f64>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match score {
            None => serializer.serialize_none(),
            Some(s) if *s == f64::INFINITY => serializer.serialize_bool(true),
            Some(s) if *s == f64::NEG_INFINITY => serializer.serialize_bool(false),
            Some(s) => serializer.serialize_f64(*s),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawScore {
        Bool(bool),
        Number(f64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<f64>, D::Error> {
        Ok(Option::<RawScore>::deserialize(deserializer)?.map(|raw| match raw {
            RawScore::Bool(true) => f64::INFINITY,
            RawScore::Bool(false) => f64::NEG_INFINITY,
            RawScore::Number(n) => n,
        }))
    }
}

/// On-disk shape: source path -> faults in that file.
pub type FaultFile = BTreeMap<String, Vec<FaultRecord>>;

/// One entry of a fault file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    #[serde(with = "sentinel", default)]
    pub score: Option<f64>,
    pub location: ExpressionSpan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<Map<String, Value>>,
}

/// Flattens a fault file into a suspiciousness-ordered list.
pub fn convert(fault_file: FaultFile) -> Vec<Fault> {
    let mut faults: Vec<Fault> = fault_file
        .into_iter()
        .flat_map(|(source_path, records)| {
            records.into_iter().map(move |record| Fault {
                source_path: source_path.clone(),
                location: record.location,
                score: record.score,
                other: record.other,
            })
        })
        .collect();
    sort_by_suspiciousness(&mut faults);
    faults
}

pub fn record_faults(path: &Path, faults: &[Fault]) -> Result<()> {
    if let Some(score) = faults.iter().filter_map(|f| f.score).find(|s| s.is_nan()) {
        return Err(FaultError::InvalidScore(score));
    }

    let mut sorted = faults.to_vec();
    sort_by_suspiciousness(&mut sorted);

    let mut fault_file = FaultFile::new();
    for fault in sorted {
        fault_file
            .entry(fault.source_path)
            .or_default()
            .push(FaultRecord {
                score: fault.score,
                location: fault.location,
                other: fault.other,
            });
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&fault_file)?)?;
    Ok(())
}

pub fn read_fault_file(path: &Path) -> Result<Vec<Fault>> {
    let content = fs::read_to_string(path)?;
    let fault_file: FaultFile = serde_json::from_str(&content)?;
    Ok(convert(fault_file))
}
