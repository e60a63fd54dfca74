use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text,
    Integer,
    Float,
}

impl ValueType {
    pub fn coerce(&self, raw: &str) -> Result<ConditionValue, CoerceError> {
        match self {
            ValueType::Text => Ok(ConditionValue::Text(raw.to_string())),
            ValueType::Integer => raw
                .parse::<i64>()
                .map(ConditionValue::Integer)
                .map_err(|_| CoerceError {
                    raw: raw.to_string(),
                    wanted: *self,
                }),
            ValueType::Float => raw
                .parse::<f64>()
                .map(ConditionValue::Float)
                .map_err(|_| CoerceError {
                    raw: raw.to_string(),
                    wanted: *self,
                }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("cannot interpret label `{raw}` as {wanted}")]
pub struct CoerceError {
    pub raw: String,
    pub wanted: ValueType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ConditionValue {
    fn rank(&self) -> u8 {
        match self {
            ConditionValue::Integer(_) => 0,
            ConditionValue::Float(_) => 1,
            ConditionValue::Text(_) => 2,
        }
    }
}

impl PartialEq for ConditionValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ConditionValue {}

impl Ord for ConditionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ConditionValue::Integer(a), ConditionValue::Integer(b)) => a.cmp(b),
            (ConditionValue::Float(a), ConditionValue::Float(b)) => a.total_cmp(b),
            (ConditionValue::Text(a), ConditionValue::Text(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for ConditionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Integer(v) => write!(f, "{}", v),
            ConditionValue::Float(v) => write!(f, "{}", v),
            ConditionValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::Text(value.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> Self {
        ConditionValue::Text(value)
    }
}

impl From<i64> for ConditionValue {
    fn from(value: i64) -> Self {
        ConditionValue::Integer(value)
    }
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        ConditionValue::Float(value)
    }
}

pub trait Source: fmt::Debug + Send + Sync {
    fn path(&self) -> &Path;

    fn kind(&self) -> &str;

    fn default_extension(&self) -> Option<&str> {
        None
    }

    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn generate(&self, _deps: &BTreeMap<String, SourceHandle>) -> Result<SourceHandle, SourceError> {
        Err(SourceError::NotGenerable {
            kind: self.kind().to_string(),
        })
    }
}

pub type SourceHandle = Arc<dyn Source>;

pub fn sources_equal(a: &dyn Source, b: &dyn Source) -> bool {
    a.kind() == b.kind() && a.path() == b.path()
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source kind `{kind}` declares no generate step")]
    NotGenerable { kind: String },
    #[error("generating `{kind}` for trial `{trial}` requires a `{needs}` source, which is not bound")]
    MissingDependency {
        kind: String,
        needs: String,
        trial: String,
    },
    #[error("generation of `{kind}` failed: {message}")]
    GenerateFailed { kind: String, message: String },
}

#[derive(Debug, Clone)]
pub struct FileSource {
    kind: String,
    path: PathBuf,
    ext: Option<String>,
}

impl FileSource {
    pub fn new(kind: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
            ext: None,
        }
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }
}

impl Source for FileSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn default_extension(&self) -> Option<&str> {
        self.ext.as_deref()
    }
}

#[derive(Debug, Clone, Error)]
#[error("slot `{slot}` of trial `{trial}` is already bound (subset `{subset}`): `{}` vs `{}`", .existing.display(), .candidate.display())]
pub struct DuplicateSource {
    pub subset: String,
    pub slot: String,
    pub trial: String,
    pub subject: ConditionValue,
    pub conditions: BTreeMap<String, ConditionValue>,
    pub existing: PathBuf,
    pub candidate: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

#[derive(Debug, Clone)]
pub struct Trial {
    subject: ConditionValue,
    name: String,
    conditions: BTreeMap<String, ConditionValue>,
    sources: BTreeMap<String, SourceHandle>,
}

impl Trial {
    pub fn new(
        subject: ConditionValue,
        name: impl Into<String>,
        conditions: BTreeMap<String, ConditionValue>,
    ) -> Self {
        Self {
            subject,
            name: name.into(),
            conditions,
            sources: BTreeMap::new(),
        }
    }

    pub fn subject(&self) -> &ConditionValue {
        &self.subject
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conditions(&self) -> &BTreeMap<String, ConditionValue> {
        &self.conditions
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionValue> {
        self.conditions.get(name)
    }

    pub fn sources(&self) -> &BTreeMap<String, SourceHandle> {
        &self.sources
    }

    pub fn source(&self, slot: &str) -> Option<&SourceHandle> {
        self.sources.get(slot)
    }

    pub fn has_source(&self, slot: &str) -> bool {
        self.sources.contains_key(slot)
    }

    pub fn source_of_kind(&self, kind: &str) -> Option<&SourceHandle> {
        self.sources.values().find(|s| s.kind() == kind)
    }

    pub fn bind_source(
        &mut self,
        subset: &str,
        slot: &str,
        source: SourceHandle,
    ) -> Result<BindOutcome, Box<DuplicateSource>> {
        if let Some(existing) = self.sources.get(slot) {
            if existing.path() == source.path() {
                return Ok(BindOutcome::AlreadyBound);
            }
            return Err(Box::new(DuplicateSource {
                subset: subset.to_string(),
                slot: slot.to_string(),
                trial: self.name.clone(),
                subject: self.subject.clone(),
                conditions: self.conditions.clone(),
                existing: existing.path().to_path_buf(),
                candidate: source.path().to_path_buf(),
            }));
        }
        self.sources.insert(slot.to_string(), source);
        Ok(BindOutcome::Bound)
    }
}

pub fn generate_source(trial: &Trial, template: &dyn Source) -> Result<SourceHandle, SourceError> {
    let mut deps: BTreeMap<String, SourceHandle> = BTreeMap::new();
    for needed in template.dependencies() {
        match trial.source_of_kind(needed) {
            Some(found) => {
                deps.insert(needed.to_string(), found.clone());
            }
            None => {
                return Err(SourceError::MissingDependency {
                    kind: template.kind().to_string(),
                    needs: needed.to_string(),
                    trial: trial.name().to_string(),
                })
            }
        }
    }
    template.generate(&deps)
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("trial `{trial}` has no source in slot `{slot}`")]
    UnknownSlot { trial: String, slot: String },
    #[error("segment condition `{name}` collides with trial `{trial}`: `{ours}` vs `{theirs}`")]
    ConditionClash {
        trial: String,
        name: String,
        ours: ConditionValue,
        theirs: ConditionValue,
    },
}

#[derive(Debug, Clone)]
pub struct Segment {
    subject: ConditionValue,
    trial_name: String,
    source: SourceHandle,
    start: Option<f64>,
    end: Option<f64>,
    conditions: BTreeMap<String, ConditionValue>,
}

impl Segment {
    pub fn new(
        trial: &Trial,
        slot: &str,
        start: Option<f64>,
        end: Option<f64>,
        extra: BTreeMap<String, ConditionValue>,
    ) -> Result<Self, SegmentError> {
        let source = trial
            .source(slot)
            .cloned()
            .ok_or_else(|| SegmentError::UnknownSlot {
                trial: trial.name().to_string(),
                slot: slot.to_string(),
            })?;
        let mut conditions = trial.conditions().clone();
        for (name, value) in extra {
            match conditions.get(&name) {
                Some(existing) if *existing != value => {
                    return Err(SegmentError::ConditionClash {
                        trial: trial.name().to_string(),
                        name,
                        ours: value,
                        theirs: existing.clone(),
                    })
                }
                _ => {
                    conditions.insert(name, value);
                }
            }
        }
        Ok(Self {
            subject: trial.subject().clone(),
            trial_name: trial.name().to_string(),
            source,
            start,
            end,
            conditions,
        })
    }

    pub fn whole(trial: &Trial, slot: &str) -> Result<Self, SegmentError> {
        Segment::new(trial, slot, None, None, BTreeMap::new())
    }

    pub fn subject(&self) -> &ConditionValue {
        &self.subject
    }

    pub fn trial_name(&self) -> &str {
        &self.trial_name
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    pub fn start(&self) -> Option<f64> {
        self.start
    }

    pub fn end(&self) -> Option<f64> {
        self.end
    }

    pub fn conditions(&self) -> &BTreeMap<String, ConditionValue> {
        &self.conditions
    }
}
