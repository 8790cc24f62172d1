use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::ingest::{load_and_normalize, parse_score};
use crate::models::{CohortSnapshot, ScoreRecord, SourceTag};
use crate::schema::DatasetSchema;

/// Best record under some ranking key, with the snapshot it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Superlative<'a> {
    pub tag: &'a SourceTag,
    pub record: &'a ScoreRecord,
    pub score: f64,
}

/// Snapshots loaded from a directory, in declared order.
#[derive(Debug, Default)]
pub struct SourceSet {
    pub snapshots: Vec<CohortSnapshot>,
    /// Files that failed to load; each was skipped on its own.
    pub skipped: Vec<(PathBuf, EngineError)>,
}

impl SourceSet {
    /// Load every `.csv` under `dir` whose name satisfies `accept`.
    pub fn load_dir(
        dir: &Path,
        schema: &DatasetSchema,
        accept: impl Fn(&str) -> bool,
    ) -> Result<Self> {
        if !dir.is_dir() {
            return Err(EngineError::SourceNotFound {
                path: dir.to_path_buf(),
            });
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
            })
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(&accept)
            })
            .collect();
        paths.sort();

        let mut set = SourceSet::default();
        for path in paths {
            match load_and_normalize(&path, schema) {
                Ok(snapshot) => set.snapshots.push(snapshot),
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    set.skipped.push((path, e));
                }
            }
        }
        sort_sources(&mut set.snapshots);
        info!(
            "loaded {} sources from {} ({} skipped)",
            set.snapshots.len(),
            dir.display(),
            set.skipped.len()
        );
        Ok(set)
    }

    /// Only the snapshots from `edition`, keeping declared order.
    pub fn edition(&self, edition: &str) -> Vec<&CohortSnapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.tag().edition.as_deref() == Some(edition))
            .collect()
    }

    /// Distinct editions, ascending.
    pub fn editions(&self) -> Vec<String> {
        let mut editions: Vec<String> = self
            .snapshots
            .iter()
            .filter_map(|s| s.tag().edition.clone())
            .collect();
        editions.sort();
        editions.dedup();
        editions
    }
}

/// Declared processing order: series, class, edition, subject. The sort is
/// stable, so sources with equal tags keep the order they were given in.
pub fn sort_sources(snapshots: &mut [CohortSnapshot]) {
    snapshots.sort_by(|a, b| a.tag().cmp(b.tag()));
}

/// Scan `snapshots` in order and keep the first record with the highest key.
/// Records whose key is `None` or NaN are skipped; `None` when nothing qualifies.
pub fn find_superlative<'a, I, F>(snapshots: I, key_fn: F) -> Option<Superlative<'a>>
where
    I: IntoIterator<Item = &'a CohortSnapshot>,
    F: Fn(&CohortSnapshot, &ScoreRecord) -> Option<f64>,
{
    let mut best: Option<Superlative<'a>> = None;
    for snapshot in snapshots {
        for record in snapshot.records() {
            let Some(score) = key_fn(snapshot, record).filter(|s| !s.is_nan()) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Superlative {
                    tag: snapshot.tag(),
                    record,
                    score,
                });
            }
        }
    }
    best
}

/// Best record per class label, classes ascending.
pub fn class_champions<'a, I, F>(snapshots: I, key_fn: F) -> Vec<Superlative<'a>>
where
    I: IntoIterator<Item = &'a CohortSnapshot>,
    F: Fn(&CohortSnapshot, &ScoreRecord) -> Option<f64>,
{
    let mut champions: BTreeMap<&'a str, Superlative<'a>> = BTreeMap::new();
    for snapshot in snapshots {
        for record in snapshot.records() {
            let Some(score) = key_fn(snapshot, record).filter(|s| !s.is_nan()) else {
                continue;
            };
            let class = record.class_label.as_str();
            if champions.get(class).map_or(true, |c| score > c.score) {
                champions.insert(
                    class,
                    Superlative {
                        tag: snapshot.tag(),
                        record,
                        score,
                    },
                );
            }
        }
    }
    champions.into_values().collect()
}

/// Best record per series tag, series ascending. Untagged sources are ignored.
pub fn series_superlatives<'a, I, F>(snapshots: I, key_fn: F) -> Vec<(String, Superlative<'a>)>
where
    I: IntoIterator<Item = &'a CohortSnapshot>,
    F: Fn(&CohortSnapshot, &ScoreRecord) -> Option<f64>,
{
    let mut by_series: BTreeMap<&'a str, Vec<&'a CohortSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        if let Some(series) = snapshot.tag().series.as_deref() {
            by_series.entry(series).or_default().push(snapshot);
        }
    }
    by_series
        .into_iter()
        .filter_map(|(series, group)| {
            find_superlative(group, &key_fn).map(|best| (series.to_string(), best))
        })
        .collect()
}

/// Key reading a percentage column, from passthrough fields first, then components.
pub fn percentage_key(column: &str) -> impl Fn(&CohortSnapshot, &ScoreRecord) -> Option<f64> + '_ {
    move |snapshot, record| {
        record
            .passthrough
            .get(column)
            .and_then(|raw| parse_score(raw))
            .or_else(|| snapshot.score(record, column))
    }
}

/// Key averaging every component of the record.
pub fn mean_component_key(_: &CohortSnapshot, record: &ScoreRecord) -> Option<f64> {
    if record.scores.is_empty() {
        None
    } else {
        Some(record.total() / record.scores.len() as f64)
    }
}

/// Share of skill columns the student scored above zero, as a percentage.
pub fn skill_performance(record: &ScoreRecord) -> f64 {
    if record.scores.is_empty() {
        return 0.0;
    }
    let hits = record.scores.iter().filter(|&&v| v > 0.0).count();
    hits as f64 * 100.0 / record.scores.len() as f64
}

#[derive(Default)]
struct JoinedStudent {
    student_id: String,
    slots: [Option<f64>; 2],
}

/// Join per-subject skill sheets into one snapshot per (edition, series, class),
/// with components `[first_subject, second_subject]` holding each subject's
/// [`skill_performance`]. Students are matched case-insensitively and keep the
/// name as written in the first subject's sheet; students missing either
/// subject are dropped.
pub fn combine_subjects(
    snapshots: &[CohortSnapshot],
    first_subject: &str,
    second_subject: &str,
) -> Result<Vec<CohortSnapshot>> {
    type Scope = (Option<String>, Option<String>, String);
    let mut scopes: BTreeMap<Scope, BTreeMap<String, JoinedStudent>> = BTreeMap::new();

    for snapshot in snapshots {
        let tag = snapshot.tag();
        let slot = match tag.subject.as_deref() {
            Some(s) if s.eq_ignore_ascii_case(first_subject) => 0,
            Some(s) if s.eq_ignore_ascii_case(second_subject) => 1,
            _ => continue,
        };
        for record in snapshot.records() {
            let scope = (
                tag.edition.clone(),
                tag.series.clone(),
                record.class_label.clone(),
            );
            let entry = scopes
                .entry(scope)
                .or_default()
                .entry(record.student_id.to_lowercase())
                .or_default();
            if slot == 0 || entry.student_id.is_empty() {
                entry.student_id = record.student_id.clone();
            }
            entry.slots[slot] = Some(skill_performance(record));
        }
    }

    let components = vec![first_subject.to_string(), second_subject.to_string()];
    let mut combined = Vec::with_capacity(scopes.len());
    for ((edition, series, class_label), students) in scopes {
        let records: Vec<ScoreRecord> = students
            .into_values()
            .filter_map(|joined| match joined.slots {
                [Some(a), Some(b)] => Some(ScoreRecord {
                    student_id: joined.student_id,
                    class_label: class_label.clone(),
                    scores: vec![a, b],
                    passthrough: BTreeMap::new(),
                }),
                _ => None,
            })
            .collect();
        if records.is_empty() {
            continue;
        }
        let tag = SourceTag {
            series,
            class_label: Some(class_label),
            edition,
            subject: None,
        };
        combined.push(CohortSnapshot::new(components.clone(), records)?.with_tag(tag));
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: SourceTag, components: &[&str], rows: &[(&str, &str, &[f64])]) -> CohortSnapshot {
        let records = rows
            .iter()
            .map(|(id, class, scores)| ScoreRecord {
                student_id: (*id).to_string(),
                class_label: (*class).to_string(),
                scores: scores.to_vec(),
                passthrough: BTreeMap::new(),
            })
            .collect();
        CohortSnapshot::new(components.iter().map(|c| (*c).to_string()).collect(), records)
            .unwrap()
            .with_tag(tag)
    }

    fn class_tag(class: &str, edition: &str) -> SourceTag {
        SourceTag {
            series: Some(format!("{}º Ano", &class[..1])),
            class_label: Some(class.to_string()),
            edition: Some(edition.to_string()),
            subject: None,
        }
    }

    #[test]
    fn ties_go_to_first_source_in_declared_order() {
        let mut sources = vec![
            tagged(class_tag("9B", "1ED"), &["p"], &[("Bia", "9B", &[90.0])]),
            tagged(class_tag("9A", "1ED"), &["p"], &[("Ana", "9A", &[90.0]), ("Caio", "9A", &[50.0])]),
        ];
        sort_sources(&mut sources);

        let best = find_superlative(&sources, percentage_key("p")).unwrap();
        assert_eq!(best.record.student_id, "Ana");
        assert_eq!(best.score, 90.0);
    }

    #[test]
    fn no_records_means_no_superlative() {
        let empty: Vec<CohortSnapshot> = Vec::new();
        assert!(find_superlative(&empty, mean_component_key).is_none());

        let blank = tagged(class_tag("9A", "1ED"), &["p"], &[]);
        assert!(find_superlative([&blank], mean_component_key).is_none());
    }

    #[test]
    fn passthrough_percentage_wins_over_components() {
        let mut snapshot = tagged(class_tag("9A", "1ED"), &["Mat"], &[("Ana", "9A", &[10.0])]);
        let mut records = snapshot.records().to_vec();
        records[0]
            .passthrough
            .insert("percAcertosAluno".to_string(), "87,5".to_string());
        snapshot = CohortSnapshot::new(snapshot.components().to_vec(), records)
            .unwrap()
            .with_tag(class_tag("9A", "1ED"));

        let key = percentage_key("percAcertosAluno");
        let record = &snapshot.records()[0];
        assert_eq!(key(&snapshot, record), Some(87.5));
        assert_eq!(percentage_key("Mat")(&snapshot, record), Some(10.0));
        assert_eq!(percentage_key("Port")(&snapshot, record), None);
    }

    #[test]
    fn champions_and_series_bests() {
        let sources = vec![
            tagged(class_tag("3A", "2ED"), &["p"], &[("Eva", "3A", &[70.0])]),
            tagged(class_tag("9A", "2ED"), &["p"], &[("Ana", "9A", &[60.0]), ("Caio", "9A", &[80.0])]),
            tagged(class_tag("9B", "2ED"), &["p"], &[("Bia", "9B", &[75.0])]),
        ];

        let champions = class_champions(&sources, mean_component_key);
        let names: Vec<&str> = champions
            .iter()
            .map(|c| c.record.student_id.as_str())
            .collect();
        assert_eq!(names, vec!["Eva", "Caio", "Bia"]);

        let series = series_superlatives(&sources, mean_component_key);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].0, "3º Ano");
        assert_eq!(series[1].0, "9º Ano");
        assert_eq!(series[1].1.record.student_id, "Caio");
    }

    #[test]
    fn combined_performance_requires_both_subjects() {
        let subject_tag = |subject: &str| SourceTag {
            series: Some("9º Ano".to_string()),
            class_label: None,
            edition: Some("CAED 1".to_string()),
            subject: Some(subject.to_string()),
        };
        let sources = vec![
            tagged(
                subject_tag("Portugues"),
                &["H01", "H02", "H03", "H04"],
                &[("Ana", "9A", &[1.0, 2.0, 0.0, 3.0]), ("Bia", "9A", &[1.0, 1.0, 1.0, 1.0])],
            ),
            tagged(
                subject_tag("Matematica"),
                &["H01", "H02"],
                &[("Ana", "9A", &[0.0, 2.0]), ("Caio", "9A", &[2.0, 2.0])],
            ),
        ];

        let combined = combine_subjects(&sources, "Portugues", "Matematica").unwrap();
        assert_eq!(combined.len(), 1);
        let scope = &combined[0];
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.records()[0].student_id, "Ana");
        assert_eq!(scope.records()[0].scores, vec![75.0, 50.0]);
        assert_eq!(scope.tag().class_label.as_deref(), Some("9A"));

        let best = find_superlative(&combined, mean_component_key).unwrap();
        assert_eq!(best.score, 62.5);
    }

    #[test]
    fn combined_join_ignores_name_case() {
        let subject_tag = |subject: &str| SourceTag {
            series: Some("9º Ano".to_string()),
            class_label: None,
            edition: Some("CAED 2".to_string()),
            subject: Some(subject.to_string()),
        };
        let sources = vec![
            tagged(
                subject_tag("Matematica"),
                &["H01", "H02"],
                &[("ANA SILVA", "9A", &[1.0, 0.0])],
            ),
            tagged(
                subject_tag("Portugues"),
                &["H01", "H02"],
                &[("Ana Silva", "9A", &[1.0, 1.0])],
            ),
        ];

        let combined = combine_subjects(&sources, "Portugues", "Matematica").unwrap();
        assert_eq!(combined.len(), 1);
        let record = &combined[0].records()[0];
        assert_eq!(record.student_id, "Ana Silva");
        assert_eq!(record.scores, vec![100.0, 50.0]);
    }

    #[test]
    fn loads_directory_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("9A_1ED.csv"),
            "nomeAluno;Matematica;percAcertosAluno\nAna;50;50\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("9B_1ED.csv"), "nome;Matematica\nBia;50\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let schema = crate::schema::SchemaPreset::EditionPercentages.schema();
        let set = SourceSet::load_dir(dir.path(), &schema, |_| true).unwrap();
        assert_eq!(set.snapshots.len(), 1);
        assert_eq!(set.skipped.len(), 1);
        assert_eq!(set.editions(), vec!["1ED"]);
        assert_eq!(set.edition("1ED").len(), 1);
        assert_eq!(set.snapshots[0].records()[0].class_label, "9A");
    }
}
