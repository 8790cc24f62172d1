use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Student name as it appears in the sheet, trimmed.
pub type StudentId = String;
/// Class label such as `9A`; empty when the source carries none.
pub type ClassLabel = String;

/// Canonical skill code, always rendered as `H{:02}`.
///
/// Headers arrive as `H 01`, `H01`, `h1` or `H 1` depending on who exported the
/// sheet; all of them parse to the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SkillCode(u16);

impl SkillCode {
    pub fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SkillCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{:02}", self.0)
    }
}

impl FromStr for SkillCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix('H')
            .or_else(|| trimmed.strip_prefix('h'))
            .ok_or_else(|| format!("'{trimmed}' is not a skill column"))?;
        let digits = rest.trim_start();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("'{trimmed}' is not a skill column"));
        }
        digits
            .parse::<u16>()
            .map(SkillCode)
            .map_err(|e| format!("'{trimmed}': {e}"))
    }
}

impl TryFrom<String> for SkillCode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SkillCode> for String {
    fn from(code: SkillCode) -> Self {
        code.to_string()
    }
}

/// Performance band derived from a percentile, never from the raw score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    #[serde(rename = "Excelente")]
    Excellent,
    #[serde(rename = "Acima da Média")]
    AboveAverage,
    #[serde(rename = "Na Média")]
    Average,
    #[serde(rename = "Abaixo da Média")]
    BelowAverage,
    #[serde(rename = "Precisa de Apoio")]
    NeedsSupport,
}

impl Classification {
    /// Display order, best band first.
    pub const ALL: [Classification; 5] = [
        Classification::Excellent,
        Classification::AboveAverage,
        Classification::Average,
        Classification::BelowAverage,
        Classification::NeedsSupport,
    ];

    pub fn from_percentile(percentile: f64) -> Self {
        match percentile {
            p if p >= 90.0 => Classification::Excellent,
            p if p >= 70.0 => Classification::AboveAverage,
            p if p >= 50.0 => Classification::Average,
            p if p >= 30.0 => Classification::BelowAverage,
            _ => Classification::NeedsSupport,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Classification::Excellent => "Excelente",
            Classification::AboveAverage => "Acima da Média",
            Classification::Average => "Na Média",
            Classification::BelowAverage => "Abaixo da Média",
            Classification::NeedsSupport => "Precisa de Apoio",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const LEVEL_LABELS: [&str; 4] = [
    "Não Domina",
    "Domina",
    "Domina Plenamente",
    "Completamente Dominado",
];

/// Ordinal mastery value for one (student, skill) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MasteryLevel(pub u8);

impl MasteryLevel {
    pub const NOT_MASTERED: MasteryLevel = MasteryLevel(0);

    pub fn label(self) -> &'static str {
        LEVEL_LABELS
            .get(usize::from(self.0))
            .copied()
            .unwrap_or("Desconhecido")
    }

    pub fn is_mastered(self) -> bool {
        self.0 > 0
    }
}

/// Level range `{0..=max}` attached to a dataset. Sheets carry either three
/// or four levels; the range is configuration, never inferred from values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MasteryDomain {
    levels: u8,
}

impl MasteryDomain {
    pub const THREE_LEVELS: MasteryDomain = MasteryDomain { levels: 3 };
    pub const FOUR_LEVELS: MasteryDomain = MasteryDomain { levels: 4 };

    pub fn new(levels: u8) -> Result<Self> {
        if (2..=LEVEL_LABELS.len() as u8).contains(&levels) {
            Ok(Self { levels })
        } else {
            Err(EngineError::schema(format!(
                "mastery domain must have between 2 and {} levels, got {levels}",
                LEVEL_LABELS.len()
            )))
        }
    }

    pub fn len(self) -> usize {
        usize::from(self.levels)
    }

    pub fn max(self) -> MasteryLevel {
        MasteryLevel(self.levels - 1)
    }

    pub fn levels(self) -> impl Iterator<Item = MasteryLevel> {
        (0..self.levels).map(MasteryLevel)
    }

    /// Maps a raw score onto the domain; `None` for fractions or out-of-range values.
    pub fn level_of(self, value: f64) -> Option<MasteryLevel> {
        if value.fract() != 0.0 || value < 0.0 || value >= f64::from(self.levels) {
            return None;
        }
        Some(MasteryLevel(value as u8))
    }
}

impl TryFrom<u8> for MasteryDomain {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        MasteryDomain::new(value).map_err(|e| e.to_string())
    }
}

impl From<MasteryDomain> for u8 {
    fn from(domain: MasteryDomain) -> Self {
        domain.levels
    }
}

/// Metadata recovered from a source file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SourceTag {
    pub series: Option<String>,
    pub class_label: Option<String>,
    pub edition: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub student_id: StudentId,
    pub class_label: ClassLabel,
    /// Component scores, aligned with `CohortSnapshot::components`.
    pub scores: Vec<f64>,
    /// Columns the engine ignores but hands back to the caller.
    pub passthrough: BTreeMap<String, String>,
}

impl ScoreRecord {
    pub fn total(&self) -> f64 {
        self.scores.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub total: f64,
    pub percentage: f64,
    pub percentile: f64,
    pub classification: Classification,
}

/// Immutable set of records from one assessment instance.
#[derive(Debug, Clone, Serialize)]
pub struct CohortSnapshot {
    tag: SourceTag,
    components: Vec<String>,
    records: Vec<ScoreRecord>,
    dropped_rows: usize,
}

impl CohortSnapshot {
    pub fn new(components: Vec<String>, records: Vec<ScoreRecord>) -> Result<Self> {
        let mut seen = HashSet::new();
        for record in &records {
            if record.scores.len() != components.len() {
                return Err(EngineError::schema(format!(
                    "record '{}' has {} scores for {} components",
                    record.student_id,
                    record.scores.len(),
                    components.len()
                )));
            }
            if !seen.insert(record.student_id.as_str()) {
                return Err(EngineError::parse(
                    "<records>",
                    format!("duplicate student '{}'", record.student_id),
                ));
            }
        }

        Ok(Self {
            tag: SourceTag::default(),
            components,
            records,
            dropped_rows: 0,
        })
    }

    pub fn with_tag(mut self, tag: SourceTag) -> Self {
        self.tag = tag;
        self
    }

    pub(crate) fn with_dropped_rows(mut self, dropped_rows: usize) -> Self {
        self.dropped_rows = dropped_rows;
        self
    }

    pub fn tag(&self) -> &SourceTag {
        &self.tag
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn records(&self) -> &[ScoreRecord] {
        &self.records
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c == name)
    }

    pub fn record(&self, student_id: &str) -> Option<&ScoreRecord> {
        let wanted = student_id.trim();
        self.records.iter().find(|r| r.student_id == wanted)
    }

    pub fn score(&self, record: &ScoreRecord, component: &str) -> Option<f64> {
        self.component_index(component)
            .and_then(|idx| record.scores.get(idx).copied())
    }

    /// Class labels in first-seen order.
    pub fn class_labels(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.class_label.as_str()))
            .map(|r| r.class_label.clone())
            .collect()
    }

    /// Sub-cohort restricted to `classes`; an empty filter keeps everyone.
    pub fn filter_classes(&self, classes: &[String]) -> CohortSnapshot {
        if classes.is_empty() {
            return self.clone();
        }
        let records = self
            .records
            .iter()
            .filter(|r| classes.iter().any(|c| c.trim() == r.class_label))
            .cloned()
            .collect();
        CohortSnapshot {
            tag: self.tag.clone(),
            components: self.components.clone(),
            records,
            dropped_rows: self.dropped_rows,
        }
    }

    /// Mean of each component across the cohort.
    pub fn component_means(&self) -> Result<Vec<f64>> {
        if self.records.is_empty() {
            return Err(EngineError::empty("component means"));
        }
        let n = self.records.len() as f64;
        Ok((0..self.components.len())
            .map(|idx| self.records.iter().map(|r| r.scores[idx]).sum::<f64>() / n)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, class: &str, scores: Vec<f64>) -> ScoreRecord {
        ScoreRecord {
            student_id: id.to_string(),
            class_label: class.to_string(),
            scores,
            passthrough: BTreeMap::new(),
        }
    }

    #[test]
    fn skill_codes_canonicalize_both_header_forms() {
        let spaced: SkillCode = "H 01".parse().unwrap();
        let packed: SkillCode = "H01".parse().unwrap();
        let short: SkillCode = "h7".parse().unwrap();
        assert_eq!(spaced, packed);
        assert_eq!(spaced.to_string(), "H01");
        assert_eq!(short.to_string(), "H07");
        assert!("Habilidade".parse::<SkillCode>().is_err());
        assert!("H".parse::<SkillCode>().is_err());
        assert!("Turma".parse::<SkillCode>().is_err());
    }

    #[test]
    fn classification_boundaries_are_inclusive() {
        assert_eq!(Classification::from_percentile(90.0), Classification::Excellent);
        assert_eq!(Classification::from_percentile(89.9), Classification::AboveAverage);
        assert_eq!(Classification::from_percentile(70.0), Classification::AboveAverage);
        assert_eq!(Classification::from_percentile(50.0), Classification::Average);
        assert_eq!(Classification::from_percentile(30.0), Classification::BelowAverage);
        assert_eq!(Classification::from_percentile(29.9), Classification::NeedsSupport);
    }

    #[test]
    fn mastery_domain_rejects_values_outside_range() {
        let domain = MasteryDomain::THREE_LEVELS;
        assert_eq!(domain.level_of(2.0), Some(MasteryLevel(2)));
        assert_eq!(domain.level_of(3.0), None);
        assert_eq!(domain.level_of(1.5), None);
        assert_eq!(domain.level_of(-1.0), None);
        assert_eq!(MasteryDomain::FOUR_LEVELS.level_of(3.0), Some(MasteryLevel(3)));
        assert_eq!(MasteryDomain::FOUR_LEVELS.max().label(), "Completamente Dominado");
        assert!(MasteryDomain::new(5).is_err());
    }

    #[test]
    fn snapshot_rejects_duplicate_students() {
        let result = CohortSnapshot::new(
            vec!["CAED1".to_string()],
            vec![record("Ana", "9A", vec![1.0]), record("Ana", "9B", vec![2.0])],
        );
        assert!(matches!(result, Err(EngineError::Parse { .. })));
    }

    #[test]
    fn class_filter_keeps_component_layout() {
        let snapshot = CohortSnapshot::new(
            vec!["CAED1".to_string(), "CAED2".to_string()],
            vec![
                record("Ana", "9A", vec![1.0, 2.0]),
                record("Bia", "9B", vec![3.0, 4.0]),
                record("Caio", "9A", vec![5.0, 6.0]),
            ],
        )
        .unwrap();

        let filtered = snapshot.filter_classes(&["9A".to_string()]);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.components(), snapshot.components());
        assert_eq!(snapshot.class_labels(), vec!["9A", "9B"]);

        let means = filtered.component_means().unwrap();
        assert_eq!(means, vec![3.0, 4.0]);
        assert!(snapshot
            .filter_classes(&["3C".to_string()])
            .component_means()
            .unwrap_err()
            .is_empty_cohort());
    }
}
