use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::models::CohortSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct SubjectDelta {
    pub subject: String,
    pub mean_first: f64,
    pub mean_second: f64,
    pub delta: f64,
}

/// One student's scores in both editions, over the common subjects.
#[derive(Debug, Clone, Serialize)]
pub struct PairedProfile {
    pub student_id: String,
    pub class_label: String,
    pub first: Vec<f64>,
    pub second: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossEditionSummary {
    /// Subjects present in both editions, ascending.
    pub common_subjects: Vec<String>,
    pub deltas: Vec<SubjectDelta>,
    pub profiles: Vec<PairedProfile>,
    /// Students left out of the pairing because one edition lacks them.
    pub unpaired: Vec<String>,
}

impl CrossEditionSummary {
    pub fn profile(&self, student_id: &str) -> Option<&PairedProfile> {
        let wanted = student_id.trim();
        self.profiles.iter().find(|p| p.student_id == wanted)
    }

    pub fn means_first(&self) -> Vec<f64> {
        self.deltas.iter().map(|d| d.mean_first).collect()
    }

    pub fn means_second(&self) -> Vec<f64> {
        self.deltas.iter().map(|d| d.mean_second).collect()
    }
}

/// Compare two editions of the same class over the subjects they share.
pub fn compare_editions(
    first: &CohortSnapshot,
    second: &CohortSnapshot,
) -> Result<CrossEditionSummary> {
    if first.is_empty() {
        return Err(EngineError::empty("first edition"));
    }
    if second.is_empty() {
        return Err(EngineError::empty("second edition"));
    }

    let first_subjects: BTreeSet<&str> = first.components().iter().map(String::as_str).collect();
    let second_subjects: BTreeSet<&str> =
        second.components().iter().map(String::as_str).collect();
    let common: Vec<&str> = first_subjects
        .intersection(&second_subjects)
        .copied()
        .collect();
    if common.is_empty() {
        return Err(EngineError::schema("editions share no subjects"));
    }

    let index_in = |snapshot: &CohortSnapshot| -> Vec<usize> {
        common
            .iter()
            .filter_map(|subject| snapshot.component_index(subject))
            .collect()
    };
    let first_idx = index_in(first);
    let second_idx = index_in(second);

    let first_means = first.component_means()?;
    let second_means = second.component_means()?;

    let deltas = common
        .iter()
        .zip(first_idx.iter().zip(&second_idx))
        .map(|(subject, (&a, &b))| SubjectDelta {
            subject: (*subject).to_string(),
            mean_first: first_means[a],
            mean_second: second_means[b],
            delta: second_means[b] - first_means[a],
        })
        .collect();

    let mut profiles = Vec::new();
    let mut unpaired = Vec::new();
    for record in first.records() {
        match second.record(&record.student_id) {
            Some(other) => profiles.push(PairedProfile {
                student_id: record.student_id.clone(),
                class_label: record.class_label.clone(),
                first: first_idx.iter().map(|&i| record.scores[i]).collect(),
                second: second_idx.iter().map(|&i| other.scores[i]).collect(),
            }),
            None => unpaired.push(record.student_id.clone()),
        }
    }
    unpaired.extend(
        second
            .records()
            .iter()
            .filter(|r| first.record(&r.student_id).is_none())
            .map(|r| r.student_id.clone()),
    );
    profiles.sort_by(|a, b| a.student_id.cmp(&b.student_id));

    Ok(CrossEditionSummary {
        common_subjects: common.into_iter().map(str::to_string).collect(),
        deltas,
        profiles,
        unpaired,
    })
}
