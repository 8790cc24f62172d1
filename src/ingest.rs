use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;

use log::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{CohortSnapshot, ScoreRecord, SkillCode, SourceTag};
use crate::schema::{ComponentSpec, DatasetSchema, MissingPolicy};

/// Load one delimited file and normalize it into a snapshot.
pub fn load_and_normalize(source: &Path, schema: &DatasetSchema) -> Result<CohortSnapshot> {
    if !source.is_file() {
        return Err(EngineError::SourceNotFound {
            path: source.to_path_buf(),
        });
    }

    let file = std::fs::File::open(source)?;
    let tag = tag_from_path(source);
    let snapshot = read_snapshot(file, schema, tag, source)?;
    info!(
        "loaded {} records from {} ({} dropped, schema {})",
        snapshot.len(),
        source.display(),
        snapshot.dropped_rows(),
        schema.cache_key()
    );
    Ok(snapshot)
}

/// Same as [`load_and_normalize`] over any reader; `origin` only labels errors.
///
/// Fields that are not valid UTF-8 are read as Latin-1. When the configured
/// delimiter leaves the header as a single column, the file is re-read with `,`.
pub fn read_snapshot<R: io::Read>(
    mut reader: R,
    schema: &DatasetSchema,
    tag: SourceTag,
    origin: &Path,
) -> Result<CohortSnapshot> {
    let parse_error = |detail: String| EngineError::Parse {
        path: origin.to_path_buf(),
        detail,
    };

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let delimiter = schema.delimiter as u8;
    let mut table = split_fields(&bytes, delimiter).map_err(|e| parse_error(e.to_string()))?;
    if table.headers.len() == 1 && delimiter != b',' {
        if let Ok(comma) = split_fields(&bytes, b',') {
            if comma.headers.len() > 1 {
                debug!(
                    "{}: single column with '{}', read as ','",
                    origin.display(),
                    schema.delimiter
                );
                table = comma;
            }
        }
    }

    normalize_lines(&table.headers, &table.rows, schema, tag).map_err(|e| match e {
        DuplicateOrSchema::Duplicate { student, line } => {
            parse_error(format!("duplicate student '{student}' on line {line}"))
        }
        DuplicateOrSchema::Engine(e) => e,
    })
}

struct RawTable {
    headers: Vec<String>,
    rows: Vec<(u64, Vec<String>)>,
}

fn split_fields(bytes: &[u8], delimiter: u8) -> csv::Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()?
        .iter()
        .map(|h| decode_field(h).trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        let line = record.position().map_or(0, |p| p.line());
        rows.push((line, record.iter().map(decode_field).collect()));
    }
    Ok(RawTable { headers, rows })
}

/// UTF-8 when valid, otherwise Latin-1 (every byte is its own code point).
fn decode_field(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => raw.iter().copied().map(char::from).collect(),
    }
}

/// Normalize rows already split into fields, aligned with `headers`.
pub fn normalize_rows(
    headers: &[String],
    rows: &[Vec<String>],
    schema: &DatasetSchema,
) -> Result<CohortSnapshot> {
    let numbered: Vec<(u64, Vec<String>)> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (i as u64 + 2, row.clone()))
        .collect();
    normalize_lines(headers, &numbered, schema, SourceTag::default()).map_err(|e| match e {
        DuplicateOrSchema::Duplicate { student, line } => {
            EngineError::parse("<rows>", format!("duplicate student '{student}' on line {line}"))
        }
        DuplicateOrSchema::Engine(e) => e,
    })
}

enum DuplicateOrSchema {
    Duplicate { student: String, line: u64 },
    Engine(EngineError),
}

impl From<EngineError> for DuplicateOrSchema {
    fn from(e: EngineError) -> Self {
        DuplicateOrSchema::Engine(e)
    }
}

struct ColumnLayout {
    student: usize,
    class: Option<usize>,
    components: Vec<(String, usize)>,
    passthrough: Vec<(String, usize)>,
}

fn normalize_lines(
    headers: &[String],
    rows: &[(u64, Vec<String>)],
    schema: &DatasetSchema,
    tag: SourceTag,
) -> std::result::Result<CohortSnapshot, DuplicateOrSchema> {
    let headers: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    let layout = resolve_columns(&headers, schema)?;
    let fallback_class = tag.class_label.clone().unwrap_or_default();

    let mut records = Vec::with_capacity(rows.len());
    let mut seen = HashSet::new();
    let mut dropped = 0usize;

    'rows: for (line, row) in rows {
        let field = |idx: usize| row.get(idx).map_or("", |v| v.trim());

        let student_id = field(layout.student);
        if student_id.is_empty() {
            debug!("line {line}: dropped, empty student id");
            dropped += 1;
            continue;
        }

        let mut scores = Vec::with_capacity(layout.components.len());
        for (name, idx) in &layout.components {
            match (parse_score(field(*idx)), schema.on_missing) {
                (Some(value), _) => scores.push(value),
                (None, MissingPolicy::Fill(default)) => scores.push(default),
                (None, MissingPolicy::DropRow) => {
                    debug!("line {line}: dropped, '{name}' is not numeric");
                    dropped += 1;
                    continue 'rows;
                }
            }
        }

        if !seen.insert(student_id.to_string()) {
            return Err(DuplicateOrSchema::Duplicate {
                student: student_id.to_string(),
                line: *line,
            });
        }

        let class_label = layout
            .class
            .map_or_else(|| fallback_class.clone(), |idx| field(idx).to_string());
        let passthrough: BTreeMap<String, String> = layout
            .passthrough
            .iter()
            .map(|(name, idx)| (name.clone(), field(*idx).to_string()))
            .collect();

        records.push(ScoreRecord {
            student_id: student_id.to_string(),
            class_label,
            scores,
            passthrough,
        });
    }

    if schema.sort_by_student {
        records.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    }

    let components = layout.components.into_iter().map(|(name, _)| name).collect();
    let snapshot = CohortSnapshot::new(components, records)?
        .with_tag(tag)
        .with_dropped_rows(dropped);
    Ok(snapshot)
}

fn find_column(headers: &[String], aliases: &[String]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
        .or_else(|| {
            aliases.iter().find_map(|alias| {
                headers.iter().position(|h| h.eq_ignore_ascii_case(alias))
            })
        })
}

fn resolve_columns(headers: &[String], schema: &DatasetSchema) -> Result<ColumnLayout> {
    let student = find_column(headers, &schema.student_columns).ok_or_else(|| {
        EngineError::schema(format!(
            "no student column (expected one of {})",
            schema.student_columns.join(", ")
        ))
    })?;

    let class = find_column(headers, &schema.class_columns);
    if class.is_none() && schema.require_class {
        return Err(EngineError::schema(format!(
            "no class column (expected one of {})",
            schema.class_columns.join(", ")
        )));
    }

    let reserved: HashSet<&str> = schema.reserved_columns().collect();
    let is_reserved = |idx: usize, header: &str| {
        idx == student
            || Some(idx) == class
            || reserved.contains(header)
            || header.is_empty()
    };

    let components = match &schema.components {
        ComponentSpec::Named { columns } => {
            let mut resolved = Vec::with_capacity(columns.len());
            let mut missing = Vec::new();
            for column in columns {
                match find_column(headers, std::slice::from_ref(column)) {
                    Some(idx) => resolved.push((column.trim().to_string(), idx)),
                    None => missing.push(column.as_str()),
                }
            }
            if !missing.is_empty() {
                return Err(EngineError::schema(format!(
                    "missing score columns: {}",
                    missing.join(", ")
                )));
            }
            resolved
        }
        ComponentSpec::SkillPrefix { max_index } => {
            let mut skills: Vec<(SkillCode, usize)> = Vec::new();
            for (idx, header) in headers.iter().enumerate() {
                if is_reserved(idx, header) {
                    continue;
                }
                let Ok(code) = header.parse::<SkillCode>() else {
                    continue;
                };
                if max_index.is_some_and(|max| code.index() > max) {
                    continue;
                }
                if skills.iter().any(|(existing, _)| *existing == code) {
                    return Err(EngineError::schema(format!(
                        "skill {code} appears in more than one column"
                    )));
                }
                skills.push((code, idx));
            }
            if skills.is_empty() {
                return Err(EngineError::schema("no skill columns matching 'H' prefix"));
            }
            skills.sort_by_key(|(code, _)| *code);
            skills
                .into_iter()
                .map(|(code, idx)| (code.to_string(), idx))
                .collect()
        }
        ComponentSpec::AllExcept { ignored } => {
            let resolved: Vec<(String, usize)> = headers
                .iter()
                .enumerate()
                .filter(|(idx, header)| {
                    !is_reserved(*idx, header) && !ignored.iter().any(|i| i == *header)
                })
                .map(|(idx, header)| (header.clone(), idx))
                .collect();
            if resolved.is_empty() {
                return Err(EngineError::schema("no score columns left after exclusions"));
            }
            resolved
        }
    };

    let passthrough = schema
        .passthrough
        .iter()
        .filter_map(|name| {
            headers
                .iter()
                .position(|h| h == name)
                .map(|idx| (name.clone(), idx))
        })
        .collect();

    Ok(ColumnLayout {
        student,
        class,
        components,
        passthrough,
    })
}

/// Parse a score cell, accepting `,` or `.` as decimal separator.
pub fn parse_score(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed.replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Recover class, edition, series and subject from names like
/// `9A_1ED.csv` or `CAED2_9_matematica.csv`.
pub fn tag_from_path(path: &Path) -> SourceTag {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return SourceTag::default();
    };
    let parts: Vec<&str> = stem.split('_').collect();

    if let Some(edition) = parts[0]
        .get(..4)
        .filter(|p| p.eq_ignore_ascii_case("CAED"))
        .map(|_| &parts[0][4..])
    {
        return SourceTag {
            series: parts.get(1).and_then(|s| series_label(s)),
            class_label: None,
            edition: Some(format!("CAED {edition}").trim().to_string()),
            subject: parts.get(2).map(|s| subject_label(s)),
        };
    }

    let class_label = parts[0].trim();
    if class_label.is_empty() {
        return SourceTag::default();
    }
    SourceTag {
        series: series_label(class_label),
        class_label: Some(class_label.to_string()),
        edition: parts
            .get(1)
            .filter(|p| p.to_ascii_uppercase().ends_with("ED"))
            .map(|p| p.to_ascii_uppercase()),
        subject: None,
    }
}

fn series_label(raw: &str) -> Option<String> {
    let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{digits}º Ano"))
    }
}

fn subject_label(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .map(|c| match c {
            'á' | 'Á' | 'à' | 'â' | 'ã' => 'a',
            'é' | 'É' | 'ê' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' | 'ô' | 'õ' => 'o',
            'ú' | 'Ú' => 'u',
            'ç' | 'Ç' => 'c',
            other => other,
        })
        .collect();
    let mut chars = folded.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaPreset;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn parses_both_decimal_separators() {
        assert_eq!(parse_score("12,5"), Some(12.5));
        assert_eq!(parse_score(" 7.25 "), Some(7.25));
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("ausente"), None);
        assert_eq!(parse_score("NaN"), None);
    }

    #[test]
    fn drops_rows_with_any_invalid_component() {
        let headers = strings(&[" Alunos ", "CAED1", "CAED2", "impulso"]);
        let rows = vec![
            strings(&[" Bruna ", "20", "25", "10"]),
            strings(&["Ana", "18", "", "9"]),
            strings(&["Caio", "15", "x", "7"]),
            strings(&["Davi", "10,5", "12", "3"]),
        ];
        let snapshot = normalize_rows(&headers, &rows, &SchemaPreset::Diagnostic.schema()).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.dropped_rows(), 2);
        assert_eq!(snapshot.records()[0].student_id, "Bruna");
        assert_eq!(snapshot.records()[1].scores, vec![10.5, 12.0, 3.0]);
    }

    #[test]
    fn fill_policy_keeps_rows_with_blanks() {
        let headers = strings(&["nomeAluno", "cgm", "Matematica", "Portugues", "presenca"]);
        let rows = vec![
            strings(&["Ana", "1", "50,0", "", "S"]),
            strings(&["Bia", "2", "75", "80", "N"]),
        ];
        let snapshot =
            normalize_rows(&headers, &rows, &SchemaPreset::EditionPercentages.schema()).unwrap();

        assert_eq!(snapshot.components(), &strings(&["Matematica", "Portugues"])[..]);
        assert_eq!(snapshot.records()[0].scores, vec![50.0, 0.0]);
        assert_eq!(snapshot.records()[0].passthrough["presenca"], "S");
        assert_eq!(snapshot.dropped_rows(), 0);
    }

    #[test]
    fn canonicalizes_skill_headers_and_caps_index() {
        let headers = strings(&["Aluno", "Turma", "H 02", "H 01", "H 16", "Total"]);
        let rows = vec![strings(&["Ana", "9A", "1", "2", "0", "3"])];
        let snapshot =
            normalize_rows(&headers, &rows, &SchemaPreset::Grade9Portuguese.schema()).unwrap();

        assert_eq!(snapshot.components(), &strings(&["H01", "H02"])[..]);
        assert_eq!(snapshot.records()[0].scores, vec![2.0, 1.0]);
        assert_eq!(snapshot.records()[0].class_label, "9A");
    }

    #[test]
    fn duplicate_skill_forms_are_a_schema_error() {
        let headers = strings(&["Aluno", "Turma", "H 01", "H01"]);
        let rows = vec![strings(&["Ana", "9A", "1", "1"])];
        let err = normalize_rows(&headers, &rows, &SchemaPreset::Grade9Math.schema()).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn missing_columns_are_reported() {
        let headers = strings(&["Alunos", "CAED1"]);
        let err = normalize_rows(&headers, &[], &SchemaPreset::Diagnostic.schema()).unwrap_err();
        assert!(err.to_string().contains("CAED2"));

        let headers = strings(&["Aluno", "H01"]);
        let err = normalize_rows(&headers, &[], &SchemaPreset::Grade3Math.schema()).unwrap_err();
        assert!(err.to_string().contains("class column"));

        let headers = strings(&["Aluno", "Turma", "Nota"]);
        let err = normalize_rows(&headers, &[], &SchemaPreset::CaedSkills.schema()).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn duplicate_students_after_trim_fail() {
        let headers = strings(&["Alunos", "CAED1", "CAED2", "impulso"]);
        let rows = vec![
            strings(&["Ana", "1", "2", "3"]),
            strings(&["Ana ", "4", "5", "6"]),
        ];
        let err = normalize_rows(&headers, &rows, &SchemaPreset::Diagnostic.schema()).unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn renormalizing_clean_cohort_is_stable() {
        let schema = SchemaPreset::Diagnostic.schema();
        let headers = strings(&["Alunos", "CAED1", "CAED2", "impulso"]);
        let rows = vec![
            strings(&["Ana", "1", "2", "3"]),
            strings(&["Bia", "4,5", "5", "6"]),
        ];
        let first = normalize_rows(&headers, &rows, &schema).unwrap();

        let again: Vec<Vec<String>> = first
            .records()
            .iter()
            .map(|r| {
                std::iter::once(r.student_id.clone())
                    .chain(r.scores.iter().map(f64::to_string))
                    .collect()
            })
            .collect();
        let second = normalize_rows(&headers, &again, &schema).unwrap();

        assert_eq!(first.records(), second.records());
        assert_eq!(second.dropped_rows(), 0);
    }

    #[test]
    fn tags_edition_and_caed_file_names() {
        let tag = tag_from_path(Path::new("pages/9A_1ED.csv"));
        assert_eq!(tag.class_label.as_deref(), Some("9A"));
        assert_eq!(tag.edition.as_deref(), Some("1ED"));
        assert_eq!(tag.series.as_deref(), Some("9º Ano"));

        let tag = tag_from_path(Path::new("CAED2_3_MATEMÁTICA.csv"));
        assert_eq!(tag.edition.as_deref(), Some("CAED 2"));
        assert_eq!(tag.series.as_deref(), Some("3º Ano"));
        assert_eq!(tag.subject.as_deref(), Some("Matematica"));
        assert_eq!(tag.class_label, None);
    }

    #[test]
    fn latin1_fields_are_decoded() {
        let mut bytes = b"nomeAluno;cgm;Matematica\nJo".to_vec();
        bytes.push(0xE3);
        bytes.extend_from_slice(b"o;1;80,5\nAna;2;60\n");

        let snapshot = read_snapshot(
            bytes.as_slice(),
            &SchemaPreset::EditionPercentages.schema(),
            tag_from_path(Path::new("9A_1ED.csv")),
            Path::new("9A_1ED.csv"),
        )
        .unwrap();

        assert_eq!(snapshot.len(), 2);
        let joao = snapshot.record("João").unwrap();
        assert_eq!(joao.scores, vec![80.5]);
        assert_eq!(joao.class_label, "9A");
    }

    #[test]
    fn single_column_header_falls_back_to_comma() {
        let content = "Alunos,CAED1,CAED2,impulso\nAna,20,25,10\n";
        let snapshot = read_snapshot(
            content.as_bytes(),
            &SchemaPreset::Diagnostic.schema(),
            SourceTag::default(),
            Path::new("dados.csv"),
        )
        .unwrap();

        assert_eq!(snapshot.components(), ["CAED1", "CAED2", "impulso"]);
        assert_eq!(snapshot.records()[0].total(), 55.0);
    }
}
