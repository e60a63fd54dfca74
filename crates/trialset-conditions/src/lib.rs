use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use trialset_core::{ConditionValue, ValueType};

pub const DEFAULT_SEPARATOR: &str = "[_-]?";

#[derive(Debug, Clone)]
pub enum AltForm {
    Literal(String),
    Pattern(String),
}

impl AltForm {
    fn fragment(&self) -> String {
        match self {
            AltForm::Literal(text) => regex::escape(text),
            AltForm::Pattern(pattern) => pattern.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LabelEntry {
    Canonical(String),
    Alternation { from: Vec<AltForm>, to: String },
}

impl LabelEntry {
    pub fn canonical(label: impl Into<String>) -> Self {
        LabelEntry::Canonical(label.into())
    }

    pub fn alternation<I, S>(from: I, to: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LabelEntry::Alternation {
            from: from.into_iter().map(|a| AltForm::Literal(a.into())).collect(),
            to: to.into(),
        }
    }

    pub fn pattern_alternation<I, S>(from: I, to: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LabelEntry::Alternation {
            from: from.into_iter().map(|a| AltForm::Pattern(a.into())).collect(),
            to: to.into(),
        }
    }

    fn canonical_text(&self) -> &str {
        match self {
            LabelEntry::Canonical(label) => label,
            LabelEntry::Alternation { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LabelSpec {
    Pattern(String),
    Vocabulary(Vec<LabelEntry>),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no label specification for condition `{0}`")]
    MissingLabels(String),
    #[error("empty vocabulary for condition `{0}`")]
    EmptyVocabulary(String),
    #[error("empty vocabulary entry for condition `{0}`")]
    EmptyEntry(String),
    #[error("condition name `{0}` is not usable as a capture group")]
    InvalidName(String),
    #[error("`{0}` is not a declared condition")]
    UnknownCondition(String),
    #[error("condition `{name}`: invalid pattern: {source}")]
    BadPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid subject pattern: {0}")]
    BadSubjectPattern(#[source] regex::Error),
    #[error("subject pattern must contain a `subject` capture group")]
    MissingSubjectGroup,
    #[error("combined condition pattern failed to compile: {0}")]
    BadCombined(#[source] regex::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ConditionSpec {
    names: Vec<String>,
    labels: BTreeMap<String, LabelSpec>,
    required: Option<Vec<String>>,
    types: BTreeMap<String, ValueType>,
    defaults: BTreeMap<String, ConditionValue>,
    separator: Option<String>,
}

impl ConditionSpec {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn label(mut self, name: impl Into<String>, spec: LabelSpec) -> Self {
        self.labels.insert(name.into(), spec);
        self
    }

    pub fn pattern(self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        let name = name.into();
        self.label(name, LabelSpec::Pattern(pattern.into()))
    }

    pub fn vocabulary(self, name: impl Into<String>, entries: Vec<LabelEntry>) -> Self {
        let name = name.into();
        self.label(name, LabelSpec::Vocabulary(entries))
    }

    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn value_type(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.types.insert(name.into(), ty);
        self
    }

    pub fn default_value(mut self, name: impl Into<String>, value: ConditionValue) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn compile(self) -> Result<CompiledConditions, CompileError> {
        for name in &self.names {
            if !valid_group_name(name) || name == "subject" {
                return Err(CompileError::InvalidName(name.clone()));
            }
        }
        let required: BTreeSet<String> = match &self.required {
            Some(names) => {
                for name in names {
                    if !self.names.iter().any(|n| n == name) {
                        return Err(CompileError::UnknownCondition(name.clone()));
                    }
                }
                names.iter().cloned().collect()
            }
            None => self.names.iter().cloned().collect(),
        };
        for name in self.types.keys().chain(self.defaults.keys()) {
            if !self.names.iter().any(|n| n == name) {
                return Err(CompileError::UnknownCondition(name.clone()));
            }
        }

        let separator = self
            .separator
            .clone()
            .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
        let mut body = String::new();
        let mut rules: Vec<SubstitutionRule> = Vec::new();
        for (idx, name) in self.names.iter().enumerate() {
            let spec = self
                .labels
                .get(name)
                .ok_or_else(|| CompileError::MissingLabels(name.clone()))?;
            let group_body = match spec {
                LabelSpec::Pattern(pattern) => pattern.clone(),
                LabelSpec::Vocabulary(entries) => {
                    if entries.is_empty() {
                        return Err(CompileError::EmptyVocabulary(name.clone()));
                    }
                    for entry in entries {
                        if let LabelEntry::Alternation { from, to } = entry {
                            if from.is_empty() {
                                return Err(CompileError::EmptyEntry(name.clone()));
                            }
                            let alternation = from
                                .iter()
                                .map(AltForm::fragment)
                                .collect::<Vec<_>>()
                                .join("|");
                            let pattern = Regex::new(&format!("(?:{})", alternation)).map_err(
                                |source| CompileError::BadPattern {
                                    name: name.clone(),
                                    source,
                                },
                            )?;
                            rules.push(SubstitutionRule {
                                pattern,
                                replacement: to.clone(),
                            });
                        }
                    }
                    entries
                        .iter()
                        .map(LabelEntry::canonical_text)
                        .collect::<Vec<_>>()
                        .join("|")
                }
            };
            Regex::new(&format!("(?:{})", group_body)).map_err(|source| {
                CompileError::BadPattern {
                    name: name.clone(),
                    source,
                }
            })?;
            let group = format!("(?P<{}>{})", name, group_body);
            let last = idx + 1 == self.names.len();
            if required.contains(name) {
                body.push_str(&group);
                if !last {
                    body.push_str(&separator);
                }
            } else {
                body.push_str(&format!("(?:{}{})?", group, separator));
            }
        }

        Ok(CompiledConditions {
            names: self.names,
            body,
            rules,
            required,
            types: self.types,
            defaults: self.defaults,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubstitutionRule {
    pattern: Regex,
    replacement: String,
}

impl SubstitutionRule {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

#[derive(Debug, Clone)]
pub struct CompiledConditions {
    names: Vec<String>,
    body: String,
    rules: Vec<SubstitutionRule>,
    required: BTreeSet<String>,
    types: BTreeMap<String, ValueType>,
    defaults: BTreeMap<String, ConditionValue>,
}

impl CompiledConditions {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn rules(&self) -> &[SubstitutionRule] {
        &self.rules
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(name)
    }

    pub fn value_type(&self, name: &str) -> ValueType {
        self.types.get(name).copied().unwrap_or(ValueType::Text)
    }

    pub fn default_value(&self, name: &str) -> Option<&ConditionValue> {
        self.defaults.get(name)
    }

    pub fn normalize(&self, path: &str) -> String {
        let mut out = path.to_string();
        for rule in &self.rules {
            out = rule
                .pattern
                .replace_all(&out, rule.replacement.as_str())
                .into_owned();
        }
        out
    }

    pub fn matcher(&self, subject_pattern: &str) -> Result<PathMatcher<'_>, CompileError> {
        let subject = Regex::new(subject_pattern).map_err(CompileError::BadSubjectPattern)?;
        if !subject
            .capture_names()
            .flatten()
            .any(|name| name == "subject")
        {
            return Err(CompileError::MissingSubjectGroup);
        }
        let full = format!("{}.*?{}", subject_pattern, self.body);
        let regex = Regex::new(&full).map_err(CompileError::BadCombined)?;
        Ok(PathMatcher {
            compiled: self,
            regex,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub subject: String,
    pub conditions: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct PathMatcher<'a> {
    compiled: &'a CompiledConditions,
    regex: Regex,
}

impl PathMatcher<'_> {
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn match_path(&self, path: &str) -> Option<MatchRecord> {
        let normalized = self.compiled.normalize(path);
        let caps = self.regex.captures(&normalized)?;
        let subject = caps.name("subject")?.as_str().to_string();
        for name in self.compiled.required() {
            caps.name(name)?;
        }
        let mut conditions = BTreeMap::new();
        for name in &self.compiled.names {
            if let Some(group) = caps.name(name) {
                conditions.insert(name.clone(), group.as_str().to_string());
            }
        }
        Some(MatchRecord {
            subject,
            conditions,
        })
    }
}

fn valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_stim() -> CompiledConditions {
        ConditionSpec::new(["session", "stim"])
            .pattern("session", r"\d+")
            .vocabulary(
                "stim",
                vec![
                    LabelEntry::canonical("stim"),
                    LabelEntry::canonical("placebo"),
                ],
            )
            .value_type("session", ValueType::Integer)
            .compile()
            .expect("spec compiles")
    }

    #[test]
    fn combined_pattern_extracts_subject_and_conditions() {
        let compiled = session_stim();
        let matcher = compiled.matcher(r"ID(?P<subject>\d+)").expect("matcher");
        let record = matcher
            .match_path("ID1_2_placebo.csv")
            .expect("path should match");
        assert_eq!(record.subject, "1");
        assert_eq!(record.conditions.get("session").map(String::as_str), Some("2"));
        assert_eq!(record.conditions.get("stim").map(String::as_str), Some("placebo"));
    }

    #[test]
    fn missing_required_condition_is_no_match() {
        let compiled = session_stim();
        let matcher = compiled.matcher(r"ID(?P<subject>\d+)").expect("matcher");
        assert!(matcher.match_path("ID1_2.csv").is_none());
        assert!(matcher.match_path("notes.txt").is_none());
    }

    #[test]
    fn optional_conditions_are_absent_not_empty() {
        let compiled = ConditionSpec::new(["session", "arms"])
            .pattern("session", r"\d+")
            .vocabulary("arms", vec![LabelEntry::canonical("held"), LabelEntry::canonical("norm")])
            .required(["session"])
            .compile()
            .expect("spec compiles");
        let matcher = compiled.matcher(r"ID(?P<subject>\d+)").expect("matcher");
        let record = matcher.match_path("ID4_3.csv").expect("match without arms");
        assert_eq!(record.conditions.get("session").map(String::as_str), Some("3"));
        assert!(!record.conditions.contains_key("arms"));
    }

    #[test]
    fn alternate_spellings_normalize_before_matching() {
        let compiled = ConditionSpec::new(["arms"])
            .vocabulary(
                "arms",
                vec![
                    LabelEntry::alternation(["NONE"], "held"),
                    LabelEntry::alternation(["NORM"], "norm"),
                ],
            )
            .compile()
            .expect("spec compiles");
        assert_eq!(compiled.normalize("park-NONE.csv"), "park-held.csv");

        let matcher = compiled
            .matcher(r"park(?P<subject>)")
            .expect("matcher");
        let record = matcher.match_path("park-NONE.csv").expect("match");
        assert_eq!(record.conditions.get("arms").map(String::as_str), Some("held"));
    }

    #[test]
    fn substitution_rules_chain_in_declaration_order() {
        let compiled = ConditionSpec::new(["speed"])
            .vocabulary(
                "speed",
                vec![
                    LabelEntry::alternation(["FAST"], "quick"),
                    LabelEntry::alternation(["quick"], "fast"),
                ],
            )
            .compile()
            .expect("spec compiles");
        // The first rule's output is visible to the second rule.
        assert_eq!(compiled.normalize("walk_FAST.csv"), "walk_fast.csv");
    }

    #[test]
    fn normalization_is_idempotent() {
        let compiled = ConditionSpec::new(["arms"])
            .vocabulary("arms", vec![LabelEntry::alternation(["NONE"], "held")])
            .compile()
            .expect("spec compiles");
        let once = compiled.normalize("park-NONE.csv");
        assert_eq!(compiled.normalize(&once), once);
    }

    #[test]
    fn pattern_alternates_are_used_verbatim() {
        let compiled = ConditionSpec::new(["arms"])
            .vocabulary(
                "arms",
                vec![LabelEntry::pattern_alternation([r"NO?NE"], "held")],
            )
            .compile()
            .expect("spec compiles");
        assert_eq!(compiled.normalize("a_NNE_b"), "a_held_b");
        assert_eq!(compiled.normalize("a_NONE_b"), "a_held_b");
    }

    #[test]
    fn literal_alternates_are_escaped() {
        let compiled = ConditionSpec::new(["arms"])
            .vocabulary(
                "arms",
                vec![LabelEntry::alternation(["N.E"], "held")],
            )
            .compile()
            .expect("spec compiles");
        assert_eq!(compiled.normalize("a_N.E_b"), "a_held_b");
        assert_eq!(compiled.normalize("a_NXE_b"), "a_NXE_b");
    }

    #[test]
    fn inline_case_flag_stays_scoped_to_its_condition() {
        let compiled = ConditionSpec::new(["stim", "session"])
            .pattern("stim", r"(?i)stim|placebo")
            .pattern("session", r"s\d+")
            .compile()
            .expect("spec compiles");
        let matcher = compiled.matcher(r"ID(?P<subject>\d+)").expect("matcher");
        assert!(matcher.match_path("ID2_STIM_s1.csv").is_some());
        // The session pattern is still case-sensitive.
        assert!(matcher.match_path("ID2_stim_S1.csv").is_none());
    }

    #[test]
    fn compile_rejects_missing_and_empty_specs() {
        let err = ConditionSpec::new(["session"])
            .compile()
            .expect_err("no labels");
        assert!(matches!(err, CompileError::MissingLabels(name) if name == "session"));

        let err = ConditionSpec::new(["stim"])
            .vocabulary("stim", vec![])
            .compile()
            .expect_err("empty vocabulary");
        assert!(matches!(err, CompileError::EmptyVocabulary(name) if name == "stim"));

        let err = ConditionSpec::new(["stim"])
            .vocabulary("stim", vec![LabelEntry::alternation(Vec::<String>::new(), "stim")])
            .compile()
            .expect_err("empty alternation entry");
        assert!(matches!(err, CompileError::EmptyEntry(name) if name == "stim"));
    }

    #[test]
    fn compile_rejects_bad_names_and_unknown_references() {
        let err = ConditionSpec::new(["2fast"])
            .pattern("2fast", r"\d+")
            .compile()
            .expect_err("invalid group name");
        assert!(matches!(err, CompileError::InvalidName(_)));

        let err = ConditionSpec::new(["subject"])
            .pattern("subject", r"\d+")
            .compile()
            .expect_err("collides with the subject group");
        assert!(matches!(err, CompileError::InvalidName(_)));

        let err = ConditionSpec::new(["session"])
            .pattern("session", r"\d+")
            .required(["stim"])
            .compile()
            .expect_err("required names must be declared");
        assert!(matches!(err, CompileError::UnknownCondition(name) if name == "stim"));
    }

    #[test]
    fn matcher_requires_subject_group() {
        let compiled = session_stim();
        let err = compiled.matcher(r"ID\d+").expect_err("no subject group");
        assert!(matches!(err, CompileError::MissingSubjectGroup));
    }

    #[test]
    fn subject_need_not_be_adjacent_to_conditions() {
        let compiled = session_stim();
        let matcher = compiled.matcher(r"ID(?P<subject>\d+)").expect("matcher");
        let record = matcher
            .match_path("study/ID9/visit-a/trial_3_stim.csv")
            .expect("gap between subject and conditions");
        assert_eq!(record.subject, "9");
        assert_eq!(record.conditions.get("session").map(String::as_str), Some("3"));
    }
}
