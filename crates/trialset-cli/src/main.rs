use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use trialset_analysis::{stack, unstack, write_wide_csv, ResultRecord};
use trialset_conditions::{CompiledConditions, ConditionSpec, LabelEntry};
use trialset_core::{Trial, ValueType};
use trialset_finder::{
    find_trials, summarize, DataSubset, FindOptions, FindReport, Summary, TrialRegistry,
};

#[derive(Parser)]
#[command(name = "trialset", version = "0.2.0", about = "Trial discovery for path-encoded datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Describe {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Find {
        study: PathBuf,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    Export {
        study: PathBuf,
        #[arg(long)]
        results: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { study, json } => {
            let study = load_study(&study)?;
            let matcher = study.compiled.matcher(&study.options.subject_pattern)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "pattern": matcher.pattern(),
                    "conditions": study.compiled.names(),
                    "required": study.compiled.required().collect::<Vec<_>>(),
                    "substitutions": study.compiled.rules().len(),
                    "subsets": study.subsets.iter().map(subset_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("pattern: {}", matcher.pattern());
            println!("conditions: {}", study.compiled.names().join(", "));
            println!(
                "required: {}",
                study.compiled.required().collect::<Vec<_>>().join(", ")
            );
            println!("substitutions: {}", study.compiled.rules().len());
            for subset in &study.subsets {
                println!(
                    "subset {}: root {} patterns [{}]{}",
                    subset.name(),
                    subset.root().display(),
                    subset.patterns().join(", "),
                    if subset.is_dependent() { " (dependent)" } else { "" }
                );
            }
        }
        Commands::Find { study, strict, json } => {
            let study = load_study(&study)?;
            let options = study.options.clone().strict(strict);
            let started_at = Utc::now();
            let mut registry = TrialRegistry::new();
            let report = find_trials(&mut registry, &study.subsets, &study.compiled, &options)?;
            let finished_at = Utc::now();
            let summary = summarize(&registry);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "find",
                    "started_at": started_at.to_rfc3339(),
                    "finished_at": finished_at.to_rfc3339(),
                    "report": report_to_json(&report),
                    "summary": summary_to_json(&summary),
                    "trials": registry.trials().iter().map(trial_to_json).collect::<Vec<_>>(),
                    "conflicts": registry.conflicts().iter().map(|dup| json!({
                        "subset": dup.subset,
                        "slot": dup.slot,
                        "trial": dup.trial,
                        "existing": dup.existing.display().to_string(),
                        "candidate": dup.candidate.display().to_string(),
                    })).collect::<Vec<_>>(),
                })));
            }
            print_summary(&summary, &report);
            for trial in registry.trials() {
                let conditions = trial
                    .conditions()
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join(" ");
                let slots = trial.sources().keys().cloned().collect::<Vec<_>>();
                println!(
                    "trial {}: subject {} {} sources [{}]",
                    trial.name(),
                    trial.subject(),
                    conditions,
                    slots.join(", ")
                );
            }
            if !registry.conflicts().is_empty() {
                println!("conflicts: {}", registry.conflicts().len());
                for dup in registry.conflicts() {
                    println!(
                        "  slot {} of trial {} ({} kept); add to ignore:",
                        dup.slot,
                        dup.trial,
                        dup.existing.display()
                    );
                    println!("  - {}", dup.candidate.display());
                }
            }
        }
        Commands::Export {
            study,
            results,
            out,
            json,
        } => {
            let study = load_study(&study)?;
            let text = fs::read_to_string(&results)
                .map_err(|err| anyhow!("cannot read results {}: {}", results.display(), err))?;
            let records: Vec<ResultRecord> = serde_json::from_str(&text)
                .map_err(|err| anyhow!("invalid results {}: {}", results.display(), err))?;
            let table = stack(&records, &study.condition_names);
            let wide = unstack(&table);
            let file = fs::File::create(&out)
                .map_err(|err| anyhow!("cannot create {}: {}", out.display(), err))?;
            write_wide_csv(file, &wide)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "records": records.len(),
                    "rows": table.rows.len(),
                    "columns": wide.columns.len(),
                    "subjects": wide.subjects.len(),
                    "out": out.display().to_string(),
                })));
            }
            println!("records: {}", records.len());
            println!("columns: {}", wide.columns.len());
            println!("subjects: {}", wide.subjects.len());
            println!("wrote: {}", out.display());
        }
    }
    Ok(None)
}

fn print_summary(summary: &Summary, report: &FindReport) {
    println!(
        "candidates: {} matched: {} created: {} attached: {} skipped: {}",
        report.candidates, report.matched, report.created, report.attached, report.skipped
    );
    println!("trials: {}", summary.trials);
    println!(
        "subjects: {}",
        summary
            .subjects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    for (name, values) in &summary.observed {
        let rendered = values
            .iter()
            .map(|(value, count)| format!("{} ({})", value, count))
            .collect::<Vec<_>>()
            .join(", ");
        println!("condition {}: {}", name, rendered);
    }
}

#[derive(Debug, Deserialize)]
struct StudyConfig {
    subject: String,
    #[serde(default)]
    subject_type: Option<String>,
    #[serde(default)]
    separator: Option<String>,
    conditions: Vec<ConditionConfig>,
    #[serde(default)]
    required: Option<Vec<String>>,
    #[serde(default)]
    defaults: BTreeMap<String, String>,
    sources: Vec<SourceConfig>,
    #[serde(default)]
    ignore: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    name: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    labels: Vec<LabelConfig>,
    #[serde(default, rename = "type")]
    value_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelConfig {
    Plain(String),
    Alternation {
        from: Vec<String>,
        to: String,
        #[serde(default)]
        regex: bool,
    },
}

#[derive(Debug, Deserialize)]
struct SourceConfig {
    name: String,
    root: PathBuf,
    patterns: Vec<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    dependent: bool,
}

#[derive(Debug)]
struct Study {
    compiled: CompiledConditions,
    subsets: Vec<DataSubset>,
    options: FindOptions,
    condition_names: Vec<String>,
}

fn load_study(path: &Path) -> Result<Study> {
    let text = fs::read_to_string(path)
        .map_err(|err| anyhow!("cannot read study config {}: {}", path.display(), err))?;
    let config: StudyConfig = serde_yaml::from_str(&text)
        .map_err(|err| anyhow!("invalid study config {}: {}", path.display(), err))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    build_study(config, base)
}

fn build_study(config: StudyConfig, base: &Path) -> Result<Study> {
    let condition_names: Vec<String> = config.conditions.iter().map(|c| c.name.clone()).collect();
    let mut spec = ConditionSpec::new(condition_names.clone());
    let mut types: BTreeMap<String, ValueType> = BTreeMap::new();

    for condition in &config.conditions {
        match (&condition.pattern, condition.labels.is_empty()) {
            (Some(pattern), true) => {
                spec = spec.pattern(&condition.name, pattern);
            }
            (None, false) => {
                let entries = condition
                    .labels
                    .iter()
                    .map(|label| match label {
                        LabelConfig::Plain(text) => LabelEntry::canonical(text),
                        LabelConfig::Alternation { from, to, regex } => {
                            if *regex {
                                LabelEntry::pattern_alternation(from.clone(), to)
                            } else {
                                LabelEntry::alternation(from.clone(), to)
                            }
                        }
                    })
                    .collect();
                spec = spec.vocabulary(&condition.name, entries);
            }
            (Some(_), false) => {
                return Err(anyhow!(
                    "condition `{}`: give either `pattern` or `labels`, not both",
                    condition.name
                ))
            }
            (None, true) => {
                return Err(anyhow!(
                    "condition `{}`: needs a `pattern` or a `labels` list",
                    condition.name
                ))
            }
        }
        if let Some(raw) = &condition.value_type {
            let ty = parse_value_type(raw)
                .ok_or_else(|| anyhow!("condition `{}`: unknown type `{}`", condition.name, raw))?;
            types.insert(condition.name.clone(), ty);
            spec = spec.value_type(&condition.name, ty);
        }
    }

    if let Some(required) = &config.required {
        spec = spec.required(required.clone());
    }
    if let Some(separator) = &config.separator {
        spec = spec.separator(separator);
    }
    for (name, raw) in &config.defaults {
        let ty = types.get(name).copied().unwrap_or(ValueType::Text);
        let value = ty
            .coerce(raw)
            .map_err(|err| anyhow!("default for `{}`: {}", name, err))?;
        spec = spec.default_value(name, value);
    }

    let compiled = spec.compile()?;

    let mut subsets = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let root = if source.root.is_absolute() {
            source.root.clone()
        } else {
            base.join(&source.root)
        };
        let mut subset = DataSubset::files(&source.name, root, source.patterns.clone())
            .dependent(source.dependent);
        if let Some(ext) = &source.ext {
            subset = subset.with_extension(ext);
        }
        subsets.push(subset);
    }

    let subject_type = match config.subject_type.as_deref() {
        None => ValueType::Text,
        Some(raw) => {
            parse_value_type(raw).ok_or_else(|| anyhow!("unknown subject_type `{}`", raw))?
        }
    };
    let options = FindOptions::new(&config.subject)
        .subject_type(subject_type)
        .ignore(config.ignore.clone());

    Ok(Study {
        compiled,
        subsets,
        options,
        condition_names,
    })
}

fn parse_value_type(raw: &str) -> Option<ValueType> {
    match raw {
        "text" => Some(ValueType::Text),
        "integer" => Some(ValueType::Integer),
        "float" => Some(ValueType::Float),
        _ => None,
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Find { json, .. }
        | Commands::Export { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn report_to_json(report: &FindReport) -> Value {
    json!({
        "candidates": report.candidates,
        "matched": report.matched,
        "created": report.created,
        "attached": report.attached,
        "skipped": report.skipped,
        "conflicts": report.conflicts,
    })
}

fn summary_to_json(summary: &Summary) -> Value {
    json!({
        "trials": summary.trials,
        "subjects": summary.subjects.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "conditions": summary.observed.iter().map(|(name, values)| {
            json!({
                "name": name,
                "values": values.iter().map(|(value, count)| json!({
                    "value": value.to_string(),
                    "trials": count,
                })).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    })
}

fn trial_to_json(trial: &Trial) -> Value {
    json!({
        "name": trial.name(),
        "subject": trial.subject().to_string(),
        "conditions": trial
            .conditions()
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.to_string())))
            .collect::<serde_json::Map<String, Value>>(),
        "sources": trial
            .sources()
            .iter()
            .map(|(slot, source)| json!({
                "slot": slot,
                "kind": source.kind(),
                "path": source.path().display().to_string(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn subset_to_json(subset: &DataSubset) -> Value {
    json!({
        "name": subset.name(),
        "root": subset.root().display().to_string(),
        "patterns": subset.patterns(),
        "dependent": subset.is_dependent(),
    })
}
