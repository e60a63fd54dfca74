use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;
use trialset_core::{ConditionValue, Segment};

#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub segment: Segment,
    pub results: BTreeMap<String, Value>,
}

impl SegmentResult {
    pub fn new(segment: Segment, results: BTreeMap<String, Value>) -> Self {
        Self { segment, results }
    }

    pub fn empty(segment: Segment) -> Self {
        Self {
            segment,
            results: BTreeMap::new(),
        }
    }
}

/// Subject + conditions + result map, detached from any live `Segment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub subject: ConditionValue,
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionValue>,
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
}

impl From<&SegmentResult> for ResultRecord {
    fn from(value: &SegmentResult) -> Self {
        Self {
            subject: value.segment.subject().clone(),
            conditions: value.segment.conditions().clone(),
            results: value.results.clone(),
        }
    }
}

pub fn analyze_segments<F>(segments: &[Segment], analysis: F) -> Vec<SegmentResult>
where
    F: Fn(&Segment) -> Result<BTreeMap<String, Value>> + Sync,
{
    analyze_segments_with_cancel(segments, analysis, &AtomicBool::new(false))
}

pub fn analyze_segments_with_cancel<F>(
    segments: &[Segment],
    analysis: F,
    cancel: &AtomicBool,
) -> Vec<SegmentResult>
where
    F: Fn(&Segment) -> Result<BTreeMap<String, Value>> + Sync,
{
    segments
        .par_iter()
        .map(|segment| {
            if cancel.load(Ordering::SeqCst) {
                return SegmentResult::empty(segment.clone());
            }
            match analysis(segment) {
                Ok(results) => SegmentResult::new(segment.clone(), results),
                Err(err) => {
                    error!(
                        subject = %segment.subject(),
                        trial = %segment.trial_name(),
                        source = %segment.source().path().display(),
                        "analysis failed: {:#}",
                        err
                    );
                    SegmentResult::empty(segment.clone())
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    pub subject: ConditionValue,
    pub conditions: BTreeMap<String, ConditionValue>,
    pub variable: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct LongTable {
    pub condition_names: Vec<String>,
    pub rows: Vec<LongRow>,
}

pub fn stack(records: &[ResultRecord], condition_names: &[String]) -> LongTable {
    let variables: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.results.keys().map(String::as_str))
        .collect();
    let mut rows = Vec::with_capacity(records.len() * variables.len());
    for record in records {
        let conditions: BTreeMap<String, ConditionValue> = condition_names
            .iter()
            .filter_map(|name| {
                record
                    .conditions
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        for variable in &variables {
            rows.push(LongRow {
                subject: record.subject.clone(),
                conditions: conditions.clone(),
                variable: (*variable).to_string(),
                value: record
                    .results
                    .get(*variable)
                    .cloned()
                    .unwrap_or(Value::Null),
            });
        }
    }
    LongTable {
        condition_names: condition_names.to_vec(),
        rows,
    }
}

pub fn stack_segments(results: &[SegmentResult], condition_names: &[String]) -> LongTable {
    let records: Vec<ResultRecord> = results.iter().map(ResultRecord::from).collect();
    stack(&records, condition_names)
}

#[derive(Debug, Clone)]
pub struct WideColumn {
    pub variable: String,
    pub conditions: BTreeMap<String, ConditionValue>,
    pub cells: BTreeMap<ConditionValue, Value>,
}

impl WideColumn {
    pub fn label(&self, condition_names: &[String]) -> String {
        condition_names
            .iter()
            .filter_map(|name| self.conditions.get(name))
            .map(ConditionValue::to_string)
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug, Clone, Default)]
pub struct WideTable {
    pub condition_names: Vec<String>,
    pub subjects: Vec<ConditionValue>,
    pub columns: Vec<WideColumn>,
}

pub fn unstack(table: &LongTable) -> WideTable {
    let mut subjects: BTreeSet<ConditionValue> = BTreeSet::new();
    let mut columns: BTreeMap<(String, Vec<Option<ConditionValue>>), WideColumn> = BTreeMap::new();
    for row in &table.rows {
        subjects.insert(row.subject.clone());
        let key = (
            row.variable.clone(),
            table
                .condition_names
                .iter()
                .map(|name| row.conditions.get(name).cloned())
                .collect(),
        );
        let column = columns.entry(key).or_insert_with(|| WideColumn {
            variable: row.variable.clone(),
            conditions: row.conditions.clone(),
            cells: BTreeMap::new(),
        });
        if !row.value.is_null() {
            column.cells.insert(row.subject.clone(), row.value.clone());
        }
    }
    WideTable {
        condition_names: table.condition_names.clone(),
        subjects: subjects.into_iter().collect(),
        columns: columns.into_values().collect(),
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn write_wide_csv<W: Write>(writer: W, table: &WideTable) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header: Vec<String> = vec![String::new()];
    header.extend(table.columns.iter().map(|c| c.variable.clone()));
    csv.write_record(&header)?;

    for name in &table.condition_names {
        let mut row: Vec<String> = vec![name.clone()];
        for column in &table.columns {
            row.push(
                column
                    .conditions
                    .get(name)
                    .map(ConditionValue::to_string)
                    .unwrap_or_default(),
            );
        }
        csv.write_record(&row)?;
    }

    let mut labels: Vec<String> = vec!["labels".to_string()];
    labels.extend(
        table
            .columns
            .iter()
            .map(|column| column.label(&table.condition_names)),
    );
    csv.write_record(&labels)?;

    for subject in &table.subjects {
        let mut row: Vec<String> = vec![subject.to_string()];
        for column in &table.columns {
            row.push(
                column
                    .cells
                    .get(subject)
                    .map(cell_text)
                    .unwrap_or_default(),
            );
        }
        csv.write_record(&row)?;
    }

    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use trialset_core::{FileSource, Trial};

    fn record(
        subject: &str,
        conditions: &[(&str, &str)],
        results: &[(&str, Value)],
    ) -> ResultRecord {
        ResultRecord {
            subject: ConditionValue::from(subject),
            conditions: conditions
                .iter()
                .map(|(k, v)| (k.to_string(), ConditionValue::from(*v)))
                .collect(),
            results: results
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn segment(subject: &str, stim: &str, path: &str) -> Segment {
        let mut conditions = BTreeMap::new();
        conditions.insert("stim".to_string(), ConditionValue::from(stim));
        let mut trial = Trial::new(
            ConditionValue::from(subject),
            format!("ID{}_{}", subject, stim),
            conditions,
        );
        trial
            .bind_source(
                "events",
                "events",
                Arc::new(FileSource::new("events", path)),
            )
            .expect("bind");
        Segment::whole(&trial, "events").expect("segment")
    }

    #[test]
    fn stack_emits_one_row_per_record_and_variable() {
        let records = vec![
            record(
                "1",
                &[("stim", "stim")],
                &[("peak", json!(3.5)), ("onset", json!(0.2))],
            ),
            record("2", &[("stim", "placebo")], &[("peak", json!(2.0))]),
        ];
        let names = vec!["stim".to_string()];
        let table = stack(&records, &names);

        assert_eq!(table.rows.len(), 4, "2 records x 2 variables");
        let missing: Vec<&LongRow> = table
            .rows
            .iter()
            .filter(|row| row.value.is_null())
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].variable, "onset");
        assert_eq!(missing[0].subject, ConditionValue::from("2"));
    }

    #[test]
    fn stack_keeps_only_requested_conditions() {
        let records = vec![record(
            "1",
            &[("stim", "stim"), ("arms", "held")],
            &[("peak", json!(1.0))],
        )];
        let table = stack(&records, &["stim".to_string()]);
        assert_eq!(table.rows[0].conditions.len(), 1);
        assert!(table.rows[0].conditions.contains_key("stim"));
    }

    #[test]
    fn unstack_pivots_subjects_into_cells() {
        let records = vec![
            record("1", &[("stim", "stim")], &[("peak", json!(3.5))]),
            record("2", &[("stim", "stim")], &[("peak", json!(2.5))]),
            record("1", &[("stim", "placebo")], &[("peak", json!(1.5))]),
        ];
        let names = vec!["stim".to_string()];
        let wide = unstack(&stack(&records, &names));

        assert_eq!(wide.subjects.len(), 2);
        assert_eq!(wide.columns.len(), 2, "one column per (variable, conditions)");
        let stim_col = wide
            .columns
            .iter()
            .find(|c| c.conditions.get("stim") == Some(&ConditionValue::from("stim")))
            .expect("stim column");
        assert_eq!(
            stim_col.cells.get(&ConditionValue::from("1")),
            Some(&json!(3.5))
        );
        assert_eq!(
            stim_col.cells.get(&ConditionValue::from("2")),
            Some(&json!(2.5))
        );
        let placebo_col = wide
            .columns
            .iter()
            .find(|c| c.conditions.get("stim") == Some(&ConditionValue::from("placebo")))
            .expect("placebo column");
        assert!(placebo_col.cells.get(&ConditionValue::from("2")).is_none());
    }

    #[test]
    fn wide_csv_renders_missing_cells_as_empty() {
        let records = vec![
            record("1", &[("stim", "stim")], &[("peak", json!(3.5))]),
            record("2", &[("stim", "placebo")], &[("peak", json!(2.0))]),
        ];
        let names = vec!["stim".to_string()];
        let wide = unstack(&stack(&records, &names));
        let mut buf: Vec<u8> = Vec::new();
        write_wide_csv(&mut buf, &wide).expect("csv");
        let text = String::from_utf8(buf).expect("utf8");

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ",peak,peak");
        assert_eq!(lines[1], "stim,placebo,stim");
        assert_eq!(lines[2], "labels,placebo,stim");
        assert_eq!(lines[3], "1,,3.5");
        assert_eq!(lines[4], "2,2.0,");
    }

    #[test]
    fn analyze_preserves_input_order_and_isolates_errors() {
        let segments = vec![
            segment("1", "stim", "/d/a.csv"),
            segment("2", "stim", "/d/b.csv"),
            segment("3", "stim", "/d/c.csv"),
        ];
        let results = analyze_segments(&segments, |seg| {
            if seg.subject() == &ConditionValue::from("2") {
                return Err(anyhow!("bad channel"));
            }
            let mut out = BTreeMap::new();
            out.insert("peak".to_string(), json!(seg.source().path().to_string_lossy().len()));
            Ok(out)
        });

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].segment.subject(), &ConditionValue::from("1"));
        assert_eq!(results[1].segment.subject(), &ConditionValue::from("2"));
        assert!(results[1].results.is_empty(), "failed analysis yields empty result");
        assert!(!results[0].results.is_empty());
        assert!(!results[2].results.is_empty());
    }

    #[test]
    fn cancelled_analysis_never_runs_the_closure() {
        let segments = vec![segment("1", "stim", "/d/a.csv")];
        let cancel = AtomicBool::new(true);
        let results = analyze_segments_with_cancel(&segments, |_| panic!("must not run"), &cancel);
        assert_eq!(results.len(), 1);
        assert!(results[0].results.is_empty());
    }

    #[test]
    fn result_records_round_trip_through_json() {
        let original = record(
            "1",
            &[("stim", "stim")],
            &[("peak", json!(3.5)), ("note", json!("ok"))],
        );
        let text = serde_json::to_string(&original).expect("serialize");
        let back: ResultRecord = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.subject, original.subject);
        assert_eq!(back.conditions, original.conditions);
        assert_eq!(back.results, original.results);
    }
}
