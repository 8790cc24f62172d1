use std::fmt::Write;

use chrono::NaiveDate;

use crate::mastery::MasterySummary;
use crate::metrics::ScoredCohort;
use crate::models::{Classification, MasteryLevel};

pub fn build_report(
    title: &str,
    generated_on: NaiveDate,
    scored: &ScoredCohort<'_>,
    mastery: Option<&MasterySummary>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cohort Performance Report");
    let _ = writeln!(output, "Generated for {} on {}", title, generated_on);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");

    let summary = match scored.summarize() {
        Ok(summary) => summary,
        Err(_) => {
            let _ = writeln!(output, "No students in this cohort.");
            return output;
        }
    };

    let _ = writeln!(output, "- Students: {}", summary.count);
    if scored.snapshot().dropped_rows() > 0 {
        let _ = writeln!(
            output,
            "- Rows excluded for incomplete scores: {}",
            scored.snapshot().dropped_rows()
        );
    }
    let _ = writeln!(
        output,
        "- Mean total: {:.1}/{} ({:.1}%)",
        summary.mean_total, summary.max_score, summary.mean_percentage
    );
    let _ = writeln!(output, "- Median total: {:.1}", summary.median_total);
    let _ = writeln!(output, "- Best total: {}", summary.max_total);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Performance Bands");
    for band in &summary.distribution {
        let _ = writeln!(
            output,
            "- {}: {} students ({:.1}%)",
            band.classification, band.count, band.percentage
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Students");
    for (record, metrics) in scored.ranked().iter().take(10) {
        let _ = writeln!(
            output,
            "- {} ({}) total {} ({:.1}%), percentile {:.1}",
            record.student_id,
            if record.class_label.is_empty() { "-" } else { record.class_label.as_str() },
            metrics.total,
            metrics.percentage,
            metrics.percentile
        );
    }

    let needs_support: Vec<_> = scored
        .iter()
        .filter(|(_, m)| m.classification == Classification::NeedsSupport)
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Students Needing Support");
    if needs_support.is_empty() {
        let _ = writeln!(output, "No students below the 30th percentile.");
    } else {
        for (record, metrics) in needs_support {
            let _ = writeln!(
                output,
                "- {} total {} (percentile {:.1})",
                record.student_id, metrics.total, metrics.percentile
            );
        }
    }

    if let Some(mastery) = mastery {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Hardest Skills");
        for skill in mastery.hardest_skills(10) {
            let _ = writeln!(
                output,
                "- {}: {} students not mastering ({:.1}%)",
                skill.skill,
                skill.not_mastered(),
                skill.percentages[0]
            );
        }
        let _ = writeln!(
            output,
            "- Average skills not mastered per student: {:.1}",
            mastery.average_per_student(MasteryLevel::NOT_MASTERED)
        );
        if let Some(skill) = mastery.most_common_skill(MasteryLevel::NOT_MASTERED) {
            let _ = writeln!(output, "- Most common gap: {}", skill);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::mastery::aggregate_skill_mastery;
    use crate::metrics::compute_metrics;
    use crate::models::{CohortSnapshot, MasteryDomain, ScoreRecord};

    fn snapshot() -> CohortSnapshot {
        let records = [("Ana", [0.0, 1.0]), ("Bia", [2.0, 2.0]), ("Caio", [1.0, 0.0])]
            .iter()
            .map(|(id, scores)| ScoreRecord {
                student_id: (*id).to_string(),
                class_label: "9A".to_string(),
                scores: scores.to_vec(),
                passthrough: BTreeMap::new(),
            })
            .collect();
        CohortSnapshot::new(vec!["H01".to_string(), "H02".to_string()], records).unwrap()
    }

    #[test]
    fn report_lists_bands_and_skills() {
        let cohort = snapshot();
        let scored = compute_metrics(&cohort, 4.0).unwrap();
        let mastery = aggregate_skill_mastery(&cohort, &[], MasteryDomain::THREE_LEVELS).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

        let report = build_report("9A", date, &scored, Some(&mastery));
        assert!(report.contains("Generated for 9A on 2025-06-01"));
        assert!(report.contains("- Students: 3"));
        assert!(report.contains("## Performance Bands"));
        assert!(report.contains("- Excelente: 1 students"));
        assert!(report.contains("## Hardest Skills"));
        assert!(report.contains("- H01: 1 students not mastering"));
    }

    #[test]
    fn empty_cohort_report_short_circuits() {
        let cohort = snapshot().filter_classes(&["3A".to_string()]);
        let scored = compute_metrics(&cohort, 4.0).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

        let report = build_report("3A", date, &scored, None);
        assert!(report.contains("No students in this cohort."));
        assert!(!report.contains("## Top Students"));
    }
}
