use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::models::MasteryDomain;

/// Which header columns hold score components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentSpec {
    /// Exactly these columns, all required.
    Named { columns: Vec<String> },
    /// Skill columns (`H 01` / `H01`), optionally capped at `max_index`.
    SkillPrefix {
        #[serde(default)]
        max_index: Option<u16>,
    },
    /// Every column that is not identity, passthrough or listed here.
    AllExcept {
        #[serde(default)]
        ignored: Vec<String>,
    },
}

/// What to do with a blank or non-numeric component value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// Exclude the whole row from the cohort.
    #[default]
    DropRow,
    /// Treat the value as "not assessed" and substitute a default.
    Fill(f64),
}

/// How tied totals share a percentile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TieMethod {
    /// Share of records with total <= this one.
    #[default]
    Max,
    /// Mean of the ranks the tied group occupies.
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_student_columns")]
    pub student_columns: Vec<String>,
    #[serde(default = "default_class_columns")]
    pub class_columns: Vec<String>,
    #[serde(default)]
    pub require_class: bool,
    pub components: ComponentSpec,
    #[serde(default)]
    pub on_missing: MissingPolicy,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default = "default_per_component_max")]
    pub per_component_max: f64,
    #[serde(default)]
    pub mastery_levels: Option<MasteryDomain>,
    #[serde(default)]
    pub sort_by_student: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub tie_method: TieMethod,
    #[serde(default)]
    pub passthrough: Vec<String>,
}

fn default_version() -> u32 {
    1
}

fn default_student_columns() -> Vec<String> {
    to_strings(&["Alunos", "Aluno", "aluno", "nomeAluno"])
}

fn default_class_columns() -> Vec<String> {
    to_strings(&["Turma", "turma"])
}

fn default_per_component_max() -> f64 {
    1.0
}

fn default_delimiter() -> char {
    ';'
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

impl DatasetSchema {
    fn base(name: &str, components: ComponentSpec) -> Self {
        Self {
            name: name.to_string(),
            version: default_version(),
            student_columns: default_student_columns(),
            class_columns: default_class_columns(),
            require_class: false,
            components,
            on_missing: MissingPolicy::DropRow,
            max_score: None,
            per_component_max: default_per_component_max(),
            mastery_levels: None,
            sort_by_student: false,
            delimiter: default_delimiter(),
            tie_method: TieMethod::Max,
            passthrough: Vec::new(),
        }
    }

    fn skill_sheet(name: &str, max_index: u16, domain: MasteryDomain) -> Self {
        let mut schema = Self::base(
            name,
            ComponentSpec::SkillPrefix {
                max_index: Some(max_index),
            },
        );
        schema.require_class = true;
        schema.mastery_levels = Some(domain);
        schema.per_component_max = f64::from(u8::from(domain) - 1);
        schema.sort_by_student = true;
        schema
    }

    /// Maximum attainable total for a cohort with `component_count` components.
    pub fn max_score(&self, component_count: usize) -> f64 {
        self.max_score
            .unwrap_or(component_count as f64 * self.per_component_max)
    }

    /// Identity and passthrough headers, never treated as components.
    pub fn reserved_columns(&self) -> impl Iterator<Item = &str> {
        self.student_columns
            .iter()
            .chain(&self.class_columns)
            .chain(&self.passthrough)
            .map(String::as_str)
    }

    /// Cache key component: changes whenever the schema definition changes.
    pub fn cache_key(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

/// Collect every configuration problem at once.
pub fn validate_schema(schema: &DatasetSchema) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if schema.name.trim().is_empty() {
        errors.push("name: must not be empty".to_string());
    }
    if schema.student_columns.is_empty() {
        errors.push("student_columns: at least one alias is required".to_string());
    }
    if schema.require_class && schema.class_columns.is_empty() {
        errors.push("class_columns: required when require_class is set".to_string());
    }
    if let ComponentSpec::Named { columns } = &schema.components {
        if columns.is_empty() {
            errors.push("components.columns: at least one column is required".to_string());
        }
    }
    if let Some(max) = schema.max_score {
        if !(max > 0.0) {
            errors.push(format!("max_score: must be positive, got {max}"));
        }
    }
    if !(schema.per_component_max > 0.0) {
        errors.push(format!(
            "per_component_max: must be positive, got {}",
            schema.per_component_max
        ));
    }
    if let MissingPolicy::Fill(value) = schema.on_missing {
        if !value.is_finite() {
            errors.push("on_missing.fill: value must be finite".to_string());
        }
    }
    if !schema.delimiter.is_ascii() {
        errors.push(format!("delimiter: '{}' is not ASCII", schema.delimiter));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load a schema definition from a JSON file.
pub fn load_schema(path: &Path) -> Result<DatasetSchema> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file at {}", path.display()))?;
    let schema: DatasetSchema = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse schema: invalid JSON in {}", path.display()))?;

    if let Err(errors) = validate_schema(&schema) {
        anyhow::bail!("Invalid schema {}: {}", path.display(), errors.join("; "));
    }
    Ok(schema)
}

/// Built-in dataset layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaPreset {
    /// CAED1 + CAED2 + impulso diagnostic totals, out of 74.
    Diagnostic,
    Grade3Portuguese,
    Grade3Math,
    Grade3Science,
    /// Four mastery levels.
    Grade9Portuguese,
    Grade9Math,
    /// Per-subject hit percentages per edition, blanks count as 0.
    EditionPercentages,
    /// Any `H*` column, used for combined performance.
    CaedSkills,
}

impl SchemaPreset {
    pub fn schema(self) -> DatasetSchema {
        match self {
            SchemaPreset::Diagnostic => {
                let mut schema = DatasetSchema::base(
                    "diagnostic",
                    ComponentSpec::Named {
                        columns: to_strings(&["CAED1", "CAED2", "impulso"]),
                    },
                );
                schema.max_score = Some(74.0);
                schema.sort_by_student = true;
                schema
            }
            SchemaPreset::Grade3Portuguese => {
                DatasetSchema::skill_sheet("grade3-portuguese", 18, MasteryDomain::THREE_LEVELS)
            }
            SchemaPreset::Grade3Math => {
                DatasetSchema::skill_sheet("grade3-math", 22, MasteryDomain::THREE_LEVELS)
            }
            SchemaPreset::Grade3Science => {
                DatasetSchema::skill_sheet("grade3-science", 15, MasteryDomain::THREE_LEVELS)
            }
            SchemaPreset::Grade9Portuguese => {
                DatasetSchema::skill_sheet("grade9-portuguese", 15, MasteryDomain::FOUR_LEVELS)
            }
            SchemaPreset::Grade9Math => {
                DatasetSchema::skill_sheet("grade9-math", 20, MasteryDomain::THREE_LEVELS)
            }
            SchemaPreset::EditionPercentages => {
                let mut schema = DatasetSchema::base(
                    "edition-percentages",
                    ComponentSpec::AllExcept {
                        ignored: to_strings(&["cgm"]),
                    },
                );
                schema.student_columns = to_strings(&["nomeAluno"]);
                schema.passthrough =
                    to_strings(&["percAcertosAluno", "percAcertosGeral", "presenca"]);
                schema.on_missing = MissingPolicy::Fill(0.0);
                schema.per_component_max = 100.0;
                schema
            }
            SchemaPreset::CaedSkills => {
                let mut schema = DatasetSchema::base(
                    "caed-skills",
                    ComponentSpec::SkillPrefix { max_index: None },
                );
                schema.require_class = true;
                schema.on_missing = MissingPolicy::Fill(0.0);
                schema
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for preset in SchemaPreset::value_variants() {
            let schema = preset.schema();
            assert!(validate_schema(&schema).is_ok(), "{} is invalid", schema.name);
        }
    }

    #[test]
    fn skill_sheet_max_score_scales_with_levels() {
        let portuguese = SchemaPreset::Grade9Portuguese.schema();
        assert_eq!(portuguese.per_component_max, 3.0);
        assert_eq!(portuguese.max_score(15), 45.0);

        let math = SchemaPreset::Grade9Math.schema();
        assert_eq!(math.max_score(20), 40.0);

        let diagnostic = SchemaPreset::Diagnostic.schema();
        assert_eq!(diagnostic.max_score(3), 74.0);
    }

    #[test]
    fn parses_minimal_json_schema() {
        let json = r#"{
            "name": "custom",
            "components": { "kind": "named", "columns": ["P1", "P2"] },
            "on_missing": { "fill": 0.0 },
            "mastery_levels": 4
        }"#;
        let schema: DatasetSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.on_missing, MissingPolicy::Fill(0.0));
        assert_eq!(schema.mastery_levels, Some(MasteryDomain::FOUR_LEVELS));
        assert_eq!(schema.delimiter, ';');
        assert_eq!(schema.tie_method, TieMethod::Max);
        assert_eq!(schema.cache_key(), "custom@v1");
    }

    #[test]
    fn validation_reports_all_errors() {
        let mut schema = SchemaPreset::Diagnostic.schema();
        schema.name = String::new();
        schema.max_score = Some(0.0);
        schema.student_columns.clear();
        let errors = validate_schema(&schema).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn rejects_unknown_level_count() {
        let json = r#"{ "name": "x", "components": { "kind": "skill_prefix" }, "mastery_levels": 7 }"#;
        assert!(serde_json::from_str::<DatasetSchema>(json).is_err());
    }
}
