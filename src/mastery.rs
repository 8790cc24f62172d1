use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::models::{CohortSnapshot, MasteryDomain, MasteryLevel, SkillCode};

#[derive(Debug, Clone, Serialize)]
pub struct SkillMastery {
    pub skill: String,
    /// Students at each level, indexed by level.
    pub counts: Vec<usize>,
    /// `counts` over the cohort size, as percentages.
    pub percentages: Vec<f64>,
    /// Share of students at any level above "Não Domina".
    pub mastery_rate: f64,
}

impl SkillMastery {
    pub fn not_mastered(&self) -> usize {
        self.counts[0]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentMastery {
    pub student_id: String,
    pub class_label: String,
    /// Skill codes at each level, indexed by level.
    pub skills_by_level: Vec<Vec<String>>,
}

impl StudentMastery {
    pub fn count(&self, level: MasteryLevel) -> usize {
        self.skills_by_level
            .get(usize::from(level.0))
            .map_or(0, Vec::len)
    }

    /// Share of the assessed skills this student holds at `level`.
    pub fn percentage(&self, level: MasteryLevel) -> f64 {
        let skills: usize = self.skills_by_level.iter().map(Vec::len).sum();
        if skills == 0 {
            0.0
        } else {
            self.count(level) as f64 * 100.0 / skills as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelGroupEntry {
    pub student_id: String,
    pub class_label: String,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassSkillRate {
    pub class_label: String,
    pub skill: String,
    pub mastery_rate: f64,
}

/// Per-skill and per-student tallies over one (possibly class-filtered) cohort.
#[derive(Debug, Clone, Serialize)]
pub struct MasterySummary {
    pub domain: MasteryDomain,
    pub cohort_size: usize,
    pub skills: Vec<SkillMastery>,
    pub students: Vec<StudentMastery>,
    #[serde(skip)]
    grid: Vec<Vec<MasteryLevel>>,
}

/// Tally mastery levels for `skill_columns` (every component when empty).
///
/// Percentages use the size of `snapshot` as denominator, so callers apply
/// class filters before aggregating.
pub fn aggregate_skill_mastery(
    snapshot: &CohortSnapshot,
    skill_columns: &[String],
    domain: MasteryDomain,
) -> Result<MasterySummary> {
    if snapshot.is_empty() {
        return Err(EngineError::empty("skill mastery"));
    }

    let columns: Vec<(String, usize)> = if skill_columns.is_empty() {
        snapshot
            .components()
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect()
    } else {
        skill_columns
            .iter()
            .map(|wanted| {
                let canonical = canonical_skill(wanted);
                snapshot
                    .component_index(&canonical)
                    .map(|idx| (canonical.clone(), idx))
                    .ok_or_else(|| EngineError::schema(format!("unknown skill column '{wanted}'")))
            })
            .collect::<Result<_>>()?
    };
    if columns.is_empty() {
        return Err(EngineError::schema("no skill columns to aggregate"));
    }

    let mut grid = Vec::with_capacity(snapshot.len());
    for record in snapshot.records() {
        let mut row = Vec::with_capacity(columns.len());
        for (skill, idx) in &columns {
            let value = record.scores[*idx];
            let level = domain.level_of(value).ok_or_else(|| {
                EngineError::schema(format!(
                    "'{}' has {value} for {skill}, outside levels 0..={}",
                    record.student_id,
                    domain.max().0
                ))
            })?;
            row.push(level);
        }
        grid.push(row);
    }

    let n = snapshot.len() as f64;
    let skills = columns
        .iter()
        .enumerate()
        .map(|(col, (skill, _))| {
            let mut counts = vec![0usize; domain.len()];
            for row in &grid {
                counts[usize::from(row[col].0)] += 1;
            }
            let percentages = counts.iter().map(|&c| c as f64 * 100.0 / n).collect();
            let mastered: usize = counts[1..].iter().sum();
            SkillMastery {
                skill: skill.clone(),
                counts,
                percentages,
                mastery_rate: mastered as f64 * 100.0 / n,
            }
        })
        .collect();

    let students = snapshot
        .records()
        .iter()
        .zip(&grid)
        .map(|(record, row)| {
            let mut skills_by_level = vec![Vec::new(); domain.len()];
            for ((skill, _), level) in columns.iter().zip(row) {
                skills_by_level[usize::from(level.0)].push(skill.clone());
            }
            StudentMastery {
                student_id: record.student_id.clone(),
                class_label: record.class_label.clone(),
                skills_by_level,
            }
        })
        .collect();

    Ok(MasterySummary {
        domain,
        cohort_size: snapshot.len(),
        skills,
        students,
        grid,
    })
}

fn canonical_skill(raw: &str) -> String {
    raw.parse::<SkillCode>()
        .map_or_else(|_| raw.trim().to_string(), |code| code.to_string())
}

/// Skill-code order; non-skill names fall back to plain string order.
fn skill_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<SkillCode>(), b.parse::<SkillCode>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

impl MasterySummary {
    pub fn skill(&self, skill: &str) -> Option<&SkillMastery> {
        let canonical = canonical_skill(skill);
        self.skills.iter().find(|s| s.skill == canonical)
    }

    pub fn student(&self, student_id: &str) -> Option<&StudentMastery> {
        let wanted = student_id.trim();
        self.students.iter().find(|s| s.student_id == wanted)
    }

    /// Skills with the most students at "Não Domina"; ties by ascending code.
    pub fn hardest_skills(&self, limit: usize) -> Vec<&SkillMastery> {
        let mut ranked: Vec<&SkillMastery> = self.skills.iter().collect();
        ranked.sort_by(|a, b| {
            Reverse(a.not_mastered())
                .cmp(&Reverse(b.not_mastered()))
                .then_with(|| skill_order(&a.skill, &b.skill))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Skills by mastery rate, highest first; ties by ascending code.
    pub fn by_mastery_rate(&self) -> Vec<&SkillMastery> {
        let mut ranked: Vec<&SkillMastery> = self.skills.iter().collect();
        ranked.sort_by(|a, b| {
            b.mastery_rate
                .total_cmp(&a.mastery_rate)
                .then_with(|| skill_order(&a.skill, &b.skill))
        });
        ranked
    }

    /// Students holding `skill` at `level`, in cohort order.
    pub fn students_at(&self, skill: &str, level: MasteryLevel) -> Vec<&StudentMastery> {
        let canonical = canonical_skill(skill);
        let Some(col) = self.skills.iter().position(|s| s.skill == canonical) else {
            return Vec::new();
        };
        self.students
            .iter()
            .zip(&self.grid)
            .filter(|(_, row)| row[col] == level)
            .map(|(student, _)| student)
            .collect()
    }

    /// Students with at least one skill at `level`, most such skills first.
    pub fn level_group(&self, level: MasteryLevel) -> Vec<LevelGroupEntry> {
        let mut entries: Vec<LevelGroupEntry> = self
            .students
            .iter()
            .filter(|s| s.count(level) > 0)
            .map(|s| LevelGroupEntry {
                student_id: s.student_id.clone(),
                class_label: s.class_label.clone(),
                skills: s.skills_by_level[usize::from(level.0)].clone(),
            })
            .collect();
        entries.sort_by_key(|e| Reverse(e.skills.len()));
        entries
    }

    /// Mode of the skills listed in [`Self::level_group`]. Ties go to the
    /// lowest skill code.
    pub fn most_common_skill(&self, level: MasteryLevel) -> Option<String> {
        let group = self.level_group(level);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for skill in group.iter().flat_map(|e| e.skills.iter()) {
            *counts.entry(skill.as_str()).or_insert(0) += 1;
        }

        counts
            .into_iter()
            .min_by(|(a, a_count), (b, b_count)| {
                b_count.cmp(a_count).then_with(|| skill_order(a, b))
            })
            .map(|(skill, _)| skill.to_string())
    }

    /// Mean number of skills per student at `level`.
    pub fn average_per_student(&self, level: MasteryLevel) -> f64 {
        let sum: usize = self.students.iter().map(|s| s.count(level)).sum();
        sum as f64 / self.cohort_size as f64
    }

    /// Share of all (student, skill) cells matching `predicate`.
    pub fn overall_share(&self, predicate: impl Fn(MasteryLevel) -> bool) -> f64 {
        let cells = self.grid.iter().map(Vec::len).sum::<usize>();
        if cells == 0 {
            return 0.0;
        }
        let hits = self.grid.iter().flatten().filter(|l| predicate(**l)).count();
        hits as f64 * 100.0 / cells as f64
    }

    /// Mastery rate of every skill within each class, classes in first-seen order.
    pub fn mastery_by_class(&self) -> Vec<ClassSkillRate> {
        let mut classes: Vec<&str> = Vec::new();
        for student in &self.students {
            if !classes.contains(&student.class_label.as_str()) {
                classes.push(student.class_label.as_str());
            }
        }

        let mut rates = Vec::with_capacity(classes.len() * self.skills.len());
        for class in classes {
            let rows: Vec<&Vec<MasteryLevel>> = self
                .students
                .iter()
                .zip(&self.grid)
                .filter(|(s, _)| s.class_label == class)
                .map(|(_, row)| row)
                .collect();
            for (col, skill) in self.skills.iter().enumerate() {
                let mastered = rows.iter().filter(|row| row[col].is_mastered()).count();
                rates.push(ClassSkillRate {
                    class_label: class.to_string(),
                    skill: skill.skill.clone(),
                    mastery_rate: mastered as f64 * 100.0 / rows.len() as f64,
                });
            }
        }
        rates
    }
}
