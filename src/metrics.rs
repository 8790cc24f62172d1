use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::models::{Classification, CohortSnapshot, DerivedMetrics, ScoreRecord};
use crate::schema::TieMethod;

/// A snapshot paired with the metrics derived from it, index-aligned.
#[derive(Debug, Clone)]
pub struct ScoredCohort<'a> {
    snapshot: &'a CohortSnapshot,
    max_score: f64,
    metrics: Vec<DerivedMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortSummary {
    pub count: usize,
    pub mean_total: f64,
    pub median_total: f64,
    pub max_total: f64,
    pub max_score: f64,
    pub mean_percentage: f64,
    pub distribution: Vec<ClassificationCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationCount {
    pub classification: Classification,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDetail<'a> {
    pub record: &'a ScoreRecord,
    pub metrics: DerivedMetrics,
    pub components: &'a [String],
    pub cohort_means: Vec<f64>,
}

pub fn compute_metrics(snapshot: &CohortSnapshot, max_score: f64) -> Result<ScoredCohort<'_>> {
    compute_metrics_with(snapshot, max_score, TieMethod::Max)
}

/// Totals, percentages, percentiles and classifications for every record in
/// one pass. An empty snapshot yields an empty result.
pub fn compute_metrics_with(
    snapshot: &CohortSnapshot,
    max_score: f64,
    tie_method: TieMethod,
) -> Result<ScoredCohort<'_>> {
    if !(max_score > 0.0) || !max_score.is_finite() {
        return Err(EngineError::schema(format!(
            "max score must be positive, got {max_score}"
        )));
    }

    let totals: Vec<f64> = snapshot.records().iter().map(ScoreRecord::total).collect();
    let percentiles = percentile_ranks(&totals, tie_method);

    let metrics = totals
        .iter()
        .zip(percentiles)
        .map(|(&total, percentile)| DerivedMetrics {
            total,
            percentage: round1(total / max_score * 100.0),
            percentile,
            classification: Classification::from_percentile(percentile),
        })
        .collect();

    Ok(ScoredCohort {
        snapshot,
        max_score,
        metrics,
    })
}

/// Percent rank of every value among `values`, in input order.
///
/// With [`TieMethod::Max`] a value's rank is the number of values `<=` it, so
/// `[10, 20, 20, 30]` gives `[25, 75, 75, 100]`. [`TieMethod::Average`] uses the
/// mean of the positions the tied group occupies (`[25, 62.5, 62.5, 100]`).
pub fn percentile_ranks(values: &[f64], tie_method: TieMethod) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;

    values
        .iter()
        .map(|&value| {
            let at_or_below = sorted.partition_point(|&x| x <= value) as f64;
            let rank = match tie_method {
                TieMethod::Max => at_or_below,
                TieMethod::Average => {
                    let below = sorted.partition_point(|&x| x < value) as f64;
                    (below + 1.0 + at_or_below) / 2.0
                }
            };
            rank * 100.0 / n
        })
        .collect()
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

impl<'a> ScoredCohort<'a> {
    pub fn snapshot(&self) -> &'a CohortSnapshot {
        self.snapshot
    }

    pub fn max_score(&self) -> f64 {
        self.max_score
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a ScoreRecord, &DerivedMetrics)> + '_ {
        self.snapshot.records().iter().zip(self.metrics.iter())
    }

    pub fn metrics_for(&self, student_id: &str) -> Option<&DerivedMetrics> {
        let wanted = student_id.trim();
        self.iter()
            .find(|(record, _)| record.student_id == wanted)
            .map(|(_, metrics)| metrics)
    }

    /// Records ordered best total first; ties keep input order.
    pub fn ranked(&self) -> Vec<(&'a ScoreRecord, &DerivedMetrics)> {
        let mut ranked: Vec<_> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.total.total_cmp(&a.1.total));
        ranked
    }

    pub fn summarize(&self) -> Result<CohortSummary> {
        if self.metrics.is_empty() {
            return Err(EngineError::empty("cohort summary"));
        }

        let totals: Vec<f64> = self.metrics.iter().map(|m| m.total).collect();
        let count = totals.len();
        let mean_total = mean(&totals).unwrap_or_default();
        let median_total = median(&totals).unwrap_or_default();
        let max_total = totals.iter().copied().fold(f64::MIN, f64::max);

        let distribution = Classification::ALL
            .iter()
            .map(|&classification| {
                let matching = self
                    .metrics
                    .iter()
                    .filter(|m| m.classification == classification)
                    .count();
                ClassificationCount {
                    classification,
                    count: matching,
                    percentage: round1(matching as f64 / count as f64 * 100.0),
                }
            })
            .collect();

        Ok(CohortSummary {
            count,
            mean_total,
            median_total,
            max_total,
            max_score: self.max_score,
            mean_percentage: round1(mean_total / self.max_score * 100.0),
            distribution,
        })
    }

    /// The selected student next to the cohort's per-component means.
    pub fn student(&self, student_id: &str) -> Result<Option<StudentDetail<'a>>> {
        let wanted = student_id.trim();
        let Some((record, metrics)) = self.iter().find(|(r, _)| r.student_id == wanted) else {
            return Ok(None);
        };
        let metrics = *metrics;
        Ok(Some(StudentDetail {
            record,
            metrics,
            components: self.snapshot.components(),
            cohort_means: self.snapshot.component_means()?,
        }))
    }
}
