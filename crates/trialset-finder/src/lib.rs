use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use trialset_conditions::{CompiledConditions, MatchRecord};
use trialset_core::{ConditionValue, DuplicateSource, FileSource, SourceHandle, Trial, ValueType};

pub type SourceBuilder = Arc<dyn Fn(&Path) -> SourceHandle + Send + Sync>;

#[derive(Clone)]
pub struct DataSubset {
    name: String,
    build: SourceBuilder,
    root: PathBuf,
    patterns: Vec<String>,
    ext: Option<String>,
    dependent: bool,
}

impl DataSubset {
    pub fn new<I, S>(
        name: impl Into<String>,
        build: SourceBuilder,
        root: impl Into<PathBuf>,
        patterns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            build,
            root: root.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            ext: None,
            dependent: false,
        }
    }

    /// Subset whose sources are plain files, bound under the subset's own kind.
    pub fn files<I, S>(name: impl Into<String>, root: impl Into<PathBuf>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let kind = name.clone();
        let build: SourceBuilder =
            Arc::new(move |path| Arc::new(FileSource::new(kind.clone(), path)) as SourceHandle);
        Self::new(name, build, root, patterns)
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    pub fn dependent(mut self, dependent: bool) -> Self {
        self.dependent = dependent;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_dependent(&self) -> bool {
        self.dependent
    }
}

impl std::fmt::Debug for DataSubset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSubset")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("patterns", &self.patterns)
            .field("ext", &self.ext)
            .field("dependent", &self.dependent)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub subject_pattern: String,
    pub subject_type: ValueType,
    pub ignore: Vec<PathBuf>,
    pub strict: bool,
}

impl FindOptions {
    pub fn new(subject_pattern: impl Into<String>) -> Self {
        Self {
            subject_pattern: subject_pattern.into(),
            subject_type: ValueType::Text,
            ignore: Vec::new(),
            strict: false,
        }
    }

    pub fn subject_type(mut self, ty: ValueType) -> Self {
        self.subject_type = ty;
        self
    }

    pub fn ignore<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.ignore = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{count} trials already carry subject `{subject}` with identical conditions (subset `{subset}`)")]
    AmbiguousMatch {
        subset: String,
        subject: String,
        count: usize,
    },
    #[error(transparent)]
    Duplicate(#[from] Box<DuplicateSource>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Created,
    Attached(usize),
    Skipped,
}

#[derive(Debug, Default)]
pub struct TrialRegistry {
    trials: Vec<Trial>,
    conflicts: Vec<DuplicateSource>,
}

impl TrialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn conflicts(&self) -> &[DuplicateSource] {
        &self.conflicts
    }

    pub fn resolve(
        &mut self,
        path: &Path,
        subset: &DataSubset,
        record: &MatchRecord,
        compiled: &CompiledConditions,
        options: &FindOptions,
    ) -> Result<ResolveOutcome, ResolveError> {
        let subject = match options.subject_type.coerce(&record.subject) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), "skipping candidate: {}", err);
                return Ok(ResolveOutcome::Skipped);
            }
        };
        let conditions = match self.coerced_conditions(path, record, compiled) {
            Some(map) => map,
            None => return Ok(ResolveOutcome::Skipped),
        };
        for name in compiled.required() {
            if !conditions.contains_key(name) {
                debug!(path = %path.display(), condition = name, "required condition unresolved");
                return Ok(ResolveOutcome::Skipped);
            }
        }

        if subset.dependent {
            let slot = match record
                .conditions
                .get(&subset.name)
                .filter(|text| !text.is_empty())
            {
                Some(text) => text.clone(),
                None => {
                    debug!(
                        path = %path.display(),
                        subset = %subset.name,
                        "dependent candidate carries no identifying token"
                    );
                    return Ok(ResolveOutcome::Skipped);
                }
            };

            let required: Vec<&str> = compiled.required().collect();
            let matching: Vec<usize> = self
                .trials
                .iter()
                .enumerate()
                .filter(|(_, trial)| {
                    trial.subject() == &subject
                        && required
                            .iter()
                            .all(|name| trial.condition(name) == conditions.get(*name))
                })
                .map(|(idx, _)| idx)
                .collect();

            if matching.is_empty() {
                debug!(
                    path = %path.display(),
                    subset = %subset.name,
                    "no existing trial for dependent candidate"
                );
                return Ok(ResolveOutcome::Skipped);
            }

            let mut attached = 0;
            for idx in matching {
                let source = (subset.build)(path);
                match self.trials[idx].bind_source(&subset.name, &slot, source) {
                    Ok(_) => attached += 1,
                    Err(dup) => {
                        self.record_conflict(*dup, options.strict)?;
                    }
                }
            }
            return if attached == 0 {
                Ok(ResolveOutcome::Skipped)
            } else {
                Ok(ResolveOutcome::Attached(attached))
            };
        }

        let matching: Vec<usize> = self
            .trials
            .iter()
            .enumerate()
            .filter(|(_, trial)| trial.subject() == &subject && trial.conditions() == &conditions)
            .map(|(idx, _)| idx)
            .collect();

        match matching.len() {
            0 => {
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("trial")
                    .to_string();
                let mut trial = Trial::new(subject, name, conditions);
                let source = (subset.build)(path);
                trial
                    .bind_source(&subset.name, &subset.name, source)
                    .map_err(ResolveError::Duplicate)?;
                self.trials.push(trial);
                Ok(ResolveOutcome::Created)
            }
            1 => {
                let source = (subset.build)(path);
                match self.trials[matching[0]].bind_source(&subset.name, &subset.name, source) {
                    Ok(_) => Ok(ResolveOutcome::Attached(1)),
                    Err(dup) => self.record_conflict(*dup, options.strict).map(|_| ResolveOutcome::Skipped),
                }
            }
            count => Err(ResolveError::AmbiguousMatch {
                subset: subset.name.clone(),
                subject: subject.to_string(),
                count,
            }),
        }
    }

    fn record_conflict(&mut self, dup: DuplicateSource, strict: bool) -> Result<(), ResolveError> {
        if strict {
            return Err(ResolveError::Duplicate(Box::new(dup)));
        }
        warn!(
            subset = %dup.subset,
            trial = %dup.trial,
            slot = %dup.slot,
            "duplicate source skipped: {}",
            dup
        );
        self.conflicts.push(dup);
        Ok(())
    }

    fn coerced_conditions(
        &self,
        path: &Path,
        record: &MatchRecord,
        compiled: &CompiledConditions,
    ) -> Option<BTreeMap<String, ConditionValue>> {
        let mut out = BTreeMap::new();
        for name in compiled.names() {
            let raw = record
                .conditions
                .get(name)
                .map(String::as_str)
                .filter(|text| !text.is_empty());
            match raw {
                Some(text) => match compiled.value_type(name).coerce(text) {
                    Ok(value) => {
                        out.insert(name.clone(), value);
                    }
                    Err(err) => {
                        warn!(path = %path.display(), condition = %name, "skipping candidate: {}", err);
                        return None;
                    }
                },
                None => {
                    if let Some(default) = compiled.default_value(name) {
                        out.insert(name.clone(), default.clone());
                    }
                }
            }
        }
        Some(out)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FindReport {
    pub candidates: usize,
    pub matched: usize,
    pub created: usize,
    pub attached: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

pub fn find_trials(
    registry: &mut TrialRegistry,
    subsets: &[DataSubset],
    compiled: &CompiledConditions,
    options: &FindOptions,
) -> Result<FindReport> {
    let matcher = compiled.matcher(&options.subject_pattern)?;
    let ignore: Vec<PathBuf> = options
        .ignore
        .iter()
        .map(|path| absolute_normalized(path))
        .collect::<Result<_>>()?;
    let conflicts_before = registry.conflicts.len();
    let mut report = FindReport::default();
    for subset in subsets {
        for file in subset_candidates(subset, &ignore)? {
            report.candidates += 1;
            let text = file.to_string_lossy();
            let record = match matcher.match_path(&text) {
                Some(record) => record,
                None => {
                    debug!(subset = %subset.name, path = %file.display(), "no match");
                    continue;
                }
            };
            report.matched += 1;
            match registry.resolve(&file, subset, &record, compiled, options)? {
                ResolveOutcome::Created => report.created += 1,
                ResolveOutcome::Attached(count) => report.attached += count,
                ResolveOutcome::Skipped => report.skipped += 1,
            }
        }
    }
    report.conflicts = registry.conflicts.len() - conflicts_before;
    Ok(report)
}

fn subset_candidates(subset: &DataSubset, ignore: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut patterns = Vec::with_capacity(subset.patterns.len());
    for raw in &subset.patterns {
        let pattern = glob::Pattern::new(raw)
            .map_err(|err| anyhow!("subset `{}`: bad glob `{}`: {}", subset.name, raw, err))?;
        patterns.push(pattern);
    }
    if !subset.root.exists() {
        warn!(subset = %subset.name, root = %subset.root.display(), "subset root does not exist");
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(&subset.root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = &subset.ext {
            let matches_ext = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(ext.as_str()))
                .unwrap_or(false);
            if !matches_ext {
                continue;
            }
        }
        let rel = entry.path().strip_prefix(&subset.root).unwrap_or(entry.path());
        if !patterns.iter().any(|pattern| pattern.matches_path(rel)) {
            continue;
        }
        let normalized = absolute_normalized(entry.path())?;
        if ignore.contains(&normalized) {
            debug!(subset = %subset.name, path = %normalized.display(), "ignored");
            continue;
        }
        out.push(normalized);
    }
    out.sort();
    Ok(out)
}

fn absolute_normalized(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_path(&absolute))
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Default, Clone)]
pub struct Summary {
    pub trials: usize,
    pub subjects: Vec<ConditionValue>,
    pub observed: BTreeMap<String, BTreeMap<ConditionValue, usize>>,
}

pub fn summarize(registry: &TrialRegistry) -> Summary {
    let mut summary = Summary {
        trials: registry.trials.len(),
        ..Summary::default()
    };
    for trial in &registry.trials {
        if !summary.subjects.contains(trial.subject()) {
            summary.subjects.push(trial.subject().clone());
        }
        for (name, value) in trial.conditions() {
            *summary
                .observed
                .entry(name.clone())
                .or_default()
                .entry(value.clone())
                .or_default() += 1;
        }
    }
    summary.subjects.sort();
    summary
}
