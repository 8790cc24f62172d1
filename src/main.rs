use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use cohort_scoring::compare::compare_editions;
use cohort_scoring::mastery::aggregate_skill_mastery;
use cohort_scoring::metrics::compute_metrics_with;
use cohort_scoring::models::{CohortSnapshot, MasteryLevel, ScoreRecord};
use cohort_scoring::schema::{load_schema, DatasetSchema, SchemaPreset, TieMethod};
use cohort_scoring::superlative::{
    class_champions, combine_subjects, mean_component_key, percentage_key, series_superlatives,
    SourceSet, Superlative,
};
use cohort_scoring::{load_and_normalize, report, EngineError};

#[derive(Parser)]
#[command(name = "cohort-scoring")]
#[command(about = "Score, rank and compare student assessment cohorts", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("layout")
        .args(["preset", "schema"])
        .required(true)
        .multiple(false)
))]
struct SchemaArgs {
    /// Built-in dataset layout
    #[arg(long, value_enum)]
    preset: Option<SchemaPreset>,
    /// JSON schema file
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Override the percentile tie convention
    #[arg(long, value_enum)]
    ties: Option<TieMethod>,
}

#[derive(Subcommand)]
enum Commands {
    /// Totals, percentiles and classifications for one file
    Metrics {
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        schema: SchemaArgs,
        /// Restrict to these classes (repeatable)
        #[arg(long = "class")]
        classes: Vec<String>,
        /// Show one student against the cohort means
        #[arg(long)]
        student: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Per-skill mastery tallies for one skill sheet
    Mastery {
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        schema: SchemaArgs,
        #[arg(long = "class")]
        classes: Vec<String>,
        /// List students at each level for this skill
        #[arg(long)]
        skill: Option<String>,
        /// Show one student's skills per level
        #[arg(long)]
        student: Option<String>,
        /// List students with skills at this level
        #[arg(long)]
        level: Option<u8>,
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Compare two editions of the same class
    Compare {
        #[arg(long)]
        first: PathBuf,
        #[arg(long)]
        second: PathBuf,
        #[command(flatten)]
        schema: SchemaArgs,
        #[arg(long)]
        student: Option<String>,
    },
    /// Best students per series and per class across a directory of files
    Superlatives {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = SuperlativeMode::Editions)]
        mode: SuperlativeMode,
        #[arg(long)]
        edition: Option<String>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        schema: SchemaArgs,
        #[arg(long = "class")]
        classes: Vec<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SuperlativeMode {
    /// `9A_1ED.csv` files ranked by `percAcertosAluno`
    Editions,
    /// `CAED<n>_<series>_<subject>.csv` skill sheets, Portuguese and Mathematics combined
    Caed,
}

#[derive(Serialize)]
struct MetricsRow<'a> {
    student_id: &'a str,
    class_label: &'a str,
    total: f64,
    percentage: f64,
    percentile: f64,
    classification: &'static str,
}

#[derive(Serialize)]
struct SuperlativeRow {
    scope: String,
    student_id: String,
    class_label: String,
    score: f64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = run(cli.command, cli.format);
    match result {
        Err(e) => match e.downcast_ref::<EngineError>() {
            Some(engine) if engine.is_empty_cohort() => {
                println!("No data for this selection ({engine}).");
                Ok(())
            }
            _ => Err(e),
        },
        Ok(()) => Ok(()),
    }
}

fn resolve_schema(args: &SchemaArgs) -> anyhow::Result<DatasetSchema> {
    let mut schema = match (&args.schema, args.preset) {
        (Some(path), _) => load_schema(path)?,
        (None, Some(preset)) => preset.schema(),
        (None, None) => anyhow::bail!("either --preset or --schema is required"),
    };
    if let Some(ties) = args.ties {
        schema.tie_method = ties;
    }
    Ok(schema)
}

fn load(source: &Path, schema: &DatasetSchema) -> anyhow::Result<CohortSnapshot> {
    load_and_normalize(source, schema)
        .with_context(|| format!("failed to load {}", source.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(command: Commands, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Commands::Metrics {
            source,
            schema,
            classes,
            student,
            limit,
        } => {
            let schema = resolve_schema(&schema)?;
            let snapshot = load(&source, &schema)?.filter_classes(&classes);
            let max_score = schema.max_score(snapshot.components().len());
            let scored = compute_metrics_with(&snapshot, max_score, schema.tie_method)?;
            let summary = scored.summarize()?;

            if let Some(student) = student {
                let detail = scored
                    .student(&student)?
                    .with_context(|| format!("student '{student}' not found"))?;
                if format == OutputFormat::Json {
                    return print_json(&detail);
                }
                println!(
                    "{}: {} ({:.1}%), percentile {:.1}, {}",
                    detail.record.student_id,
                    detail.metrics.total,
                    detail.metrics.percentage,
                    detail.metrics.percentile,
                    detail.metrics.classification
                );
                for ((name, score), mean) in detail
                    .components
                    .iter()
                    .zip(&detail.record.scores)
                    .zip(&detail.cohort_means)
                {
                    println!("  {name}: {score} (cohort mean {mean:.1})");
                }
                return Ok(());
            }

            if format == OutputFormat::Json {
                let rows: Vec<MetricsRow> = scored
                    .iter()
                    .map(|(record, metrics)| MetricsRow {
                        student_id: &record.student_id,
                        class_label: &record.class_label,
                        total: metrics.total,
                        percentage: metrics.percentage,
                        percentile: metrics.percentile,
                        classification: metrics.classification.label(),
                    })
                    .collect();
                return print_json(&serde_json::json!({ "summary": summary, "students": rows }));
            }

            println!(
                "{} students, mean {:.1}/{} ({:.1}%), median {:.1}, best {}",
                summary.count,
                summary.mean_total,
                summary.max_score,
                summary.mean_percentage,
                summary.median_total,
                summary.max_total
            );
            for band in &summary.distribution {
                println!("  {}: {} ({:.1}%)", band.classification, band.count, band.percentage);
            }
            println!("Top students:");
            for (record, metrics) in scored.ranked().iter().take(limit) {
                println!(
                    "- {} total {} ({:.1}%), percentile {:.1}, {}",
                    record.student_id,
                    metrics.total,
                    metrics.percentage,
                    metrics.percentile,
                    metrics.classification
                );
            }
        }
        Commands::Mastery {
            source,
            schema,
            classes,
            skill,
            student,
            level,
            top,
        } => {
            let schema = resolve_schema(&schema)?;
            let domain = schema
                .mastery_levels
                .with_context(|| format!("schema '{}' declares no mastery levels", schema.name))?;
            let snapshot = load(&source, &schema)?.filter_classes(&classes);
            let summary = aggregate_skill_mastery(&snapshot, &[], domain)?;

            if format == OutputFormat::Json {
                return print_json(&summary);
            }

            println!("{} students, {} skills", summary.cohort_size, summary.skills.len());
            println!(
                "Overall mastery {:.1}%, full mastery {:.1}%",
                summary.overall_share(MasteryLevel::is_mastered),
                summary.overall_share(|l| l == domain.max())
            );
            println!("Hardest skills:");
            for skill in summary.hardest_skills(top) {
                println!(
                    "- {}: {} not mastering ({:.1}%)",
                    skill.skill,
                    skill.not_mastered(),
                    skill.percentages[0]
                );
            }

            if let Some(code) = skill {
                let tally = summary
                    .skill(&code)
                    .with_context(|| format!("skill '{code}' not in this sheet"))?;
                println!("{}:", tally.skill);
                for lvl in domain.levels() {
                    let names: Vec<&str> = summary
                        .students_at(&code, lvl)
                        .iter()
                        .map(|s| s.student_id.as_str())
                        .collect();
                    println!(
                        "  {} ({:.1}%): {}",
                        lvl.label(),
                        tally.percentages[usize::from(lvl.0)],
                        names.join(", ")
                    );
                }
            }

            if let Some(id) = student {
                let profile = summary
                    .student(&id)
                    .with_context(|| format!("student '{id}' not found"))?;
                println!("{} ({}):", profile.student_id, profile.class_label);
                for lvl in domain.levels() {
                    println!(
                        "  {} {} ({:.1}%): {}",
                        lvl.label(),
                        profile.count(lvl),
                        profile.percentage(lvl),
                        profile.skills_by_level[usize::from(lvl.0)].join(", ")
                    );
                }
            }

            if let Some(raw) = level {
                let lvl = domain
                    .level_of(f64::from(raw))
                    .with_context(|| format!("level {raw} is outside 0..={}", domain.max().0))?;
                let group = summary.level_group(lvl);
                println!("{} ({} students):", lvl.label(), group.len());
                for entry in &group {
                    println!("- {} [{}]: {}", entry.student_id, entry.class_label, entry.skills.join(", "));
                }
                if let Some(common) = summary.most_common_skill(lvl) {
                    println!("Most common skill: {common}");
                }
            }
        }
        Commands::Compare {
            first,
            second,
            schema,
            student,
        } => {
            let schema = resolve_schema(&schema)?;
            let first = load(&first, &schema)?;
            let second = load(&second, &schema)?;
            let summary = compare_editions(&first, &second)?;

            if format == OutputFormat::Json {
                return print_json(&summary);
            }

            println!("Common subjects: {}", summary.common_subjects.join(", "));
            for delta in &summary.deltas {
                println!(
                    "- {}: {:.1} -> {:.1} ({:+.1})",
                    delta.subject, delta.mean_first, delta.mean_second, delta.delta
                );
            }
            println!(
                "{} students in both editions, {} unpaired",
                summary.profiles.len(),
                summary.unpaired.len()
            );

            if let Some(id) = student {
                let profile = summary
                    .profile(&id)
                    .with_context(|| format!("student '{id}' is not in both editions"))?;
                for (idx, subject) in summary.common_subjects.iter().enumerate() {
                    println!(
                        "  {subject}: {:.1} -> {:.1} (cohort {:.1} -> {:.1})",
                        profile.first[idx],
                        profile.second[idx],
                        summary.deltas[idx].mean_first,
                        summary.deltas[idx].mean_second
                    );
                }
            }
        }
        Commands::Superlatives { dir, mode, edition } => {
            let rows = match mode {
                SuperlativeMode::Editions => edition_superlatives(&dir, edition)?,
                SuperlativeMode::Caed => caed_superlatives(&dir, edition)?,
            };
            if format == OutputFormat::Json {
                return print_json(&rows);
            }
            if rows.is_empty() {
                println!("No students found for this selection.");
            }
            for row in &rows {
                println!(
                    "- {}: {} ({}) {:.2}%",
                    row.scope, row.student_id, row.class_label, row.score
                );
            }
        }
        Commands::Report {
            source,
            schema,
            classes,
            out,
        } => {
            let schema = resolve_schema(&schema)?;
            let snapshot = load(&source, &schema)?.filter_classes(&classes);
            let max_score = schema.max_score(snapshot.components().len());
            let scored = compute_metrics_with(&snapshot, max_score, schema.tie_method)?;
            let mastery = match schema.mastery_levels {
                Some(domain) if !snapshot.is_empty() => {
                    Some(aggregate_skill_mastery(&snapshot, &[], domain)?)
                }
                _ => None,
            };
            let title = if classes.is_empty() {
                source.display().to_string()
            } else {
                format!("{} ({})", source.display(), classes.join(", "))
            };
            let report = report::build_report(
                &title,
                chrono::Local::now().date_naive(),
                &scored,
                mastery.as_ref(),
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

/// Superlatives over `9A_1ED.csv`-style files, ranked by the precomputed percentage.
fn edition_superlatives(dir: &Path, edition: Option<String>) -> anyhow::Result<Vec<SuperlativeRow>> {
    let schema = SchemaPreset::EditionPercentages.schema();
    let set = SourceSet::load_dir(dir, &schema, |name| name.contains('_'))?;
    let key = percentage_key("percAcertosAluno");

    let editions = edition.map_or_else(|| set.editions(), |e| vec![e]);
    let mut rows = Vec::new();
    for ed in editions {
        rows.extend(collect_rows(&ed, &set.edition(&ed), &key));
    }
    Ok(rows)
}

/// Superlatives over CAED skill sheets, Portuguese and Mathematics combined.
fn caed_superlatives(dir: &Path, edition: Option<String>) -> anyhow::Result<Vec<SuperlativeRow>> {
    let schema = SchemaPreset::CaedSkills.schema();
    let set = SourceSet::load_dir(dir, &schema, |name| {
        name.to_ascii_uppercase().starts_with("CAED")
    })?;
    let combined = combine_subjects(&set.snapshots, "Portugues", "Matematica")?;

    let mut editions: Vec<String> = combined
        .iter()
        .filter_map(|s| s.tag().edition.clone())
        .collect();
    editions.sort();
    editions.dedup();
    if let Some(e) = edition {
        editions.retain(|ed| *ed == e);
    }

    let mut rows = Vec::new();
    for ed in editions {
        let scope: Vec<&CohortSnapshot> = combined
            .iter()
            .filter(|s| s.tag().edition.as_deref() == Some(ed.as_str()))
            .collect();
        rows.extend(collect_rows(&ed, &scope, &mean_component_key));
    }
    Ok(rows)
}

fn to_row(scope: String, best: Superlative<'_>) -> SuperlativeRow {
    SuperlativeRow {
        scope,
        student_id: best.record.student_id.clone(),
        class_label: best.record.class_label.clone(),
        score: best.score,
    }
}

fn collect_rows<F>(edition: &str, scope: &[&CohortSnapshot], key: &F) -> Vec<SuperlativeRow>
where
    F: Fn(&CohortSnapshot, &ScoreRecord) -> Option<f64>,
{
    let mut rows: Vec<SuperlativeRow> = series_superlatives(scope.iter().copied(), key)
        .into_iter()
        .map(|(series, best)| to_row(format!("{edition} / {series}"), best))
        .collect();
    rows.extend(
        class_champions(scope.iter().copied(), key)
            .into_iter()
            .map(|best| to_row(format!("{edition} / turma {}", best.record.class_label), best)),
    );
    rows
}
