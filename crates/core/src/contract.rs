#![forbid(unsafe_code)]

use crate::profile::{ContractExpectations, ValidatorSpec};
use crate::scope::{AuthorizedScope, normalize_path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const NARRATIVE_KEYS: &[&str] = &["summary", "notes", "narrative"];

/// Unparsed worker output as handed back by a dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawWorkerOutput(Value);

impl RawWorkerOutput {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Wrap worker text; text that is not JSON stays a string and is later
    /// rejected as malformed.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str(text.trim()) {
            Ok(value) => Self(value),
            Err(_) => Self(Value::String(text.to_string())),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedFlag {
    InvalidInputs,
    LogicalInconsistency { failure_count: u64 },
    ScopeViolation { paths: Vec<String> },
    MissingEvidence { field: String },
}

impl RedFlag {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInputs => "invalid inputs",
            Self::LogicalInconsistency { .. } => "logical inconsistency",
            Self::ScopeViolation { .. } => "scope violation",
            Self::MissingEvidence { .. } => "missing evidence",
        }
    }

    pub fn issue(&self) -> String {
        match self {
            Self::InvalidInputs => {
                "invalid inputs: pre-work validation did not pass".to_string()
            }
            Self::LogicalInconsistency { failure_count } => format!(
                "logical inconsistency: reported {failure_count} failure(s) while claiming all checks passed"
            ),
            Self::ScopeViolation { paths } => {
                format!("scope violation: modified outside authorized scope: {}", paths.join(", "))
            }
            Self::MissingEvidence { field } => format!("missing evidence: `{field}` is required"),
        }
    }
}

/// Typed view of the validator-specific fields the engine is allowed to reason about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorPayload {
    pub failure_count: Option<u64>,
    pub commands_executed: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// Authoritative verdict: the worker's claim AND no red flag fired.
    pub all_checks_passed: bool,
    pub claimed_pass: bool,
    pub blocking_issues: Vec<String>,
    pub pre_work_validation_passed: bool,
    pub files_modified: Vec<String>,
    pub scope_files: Vec<String>,
    pub payload: ValidatorPayload,
    pub red_flags: Vec<RedFlag>,
    /// Audit only; control flow never reads it.
    pub narrative: Option<String>,
    pub extensions: BTreeMap<String, Value>,
}

impl GateResult {
    /// Synthetic failing result for an attempt the worker never answered.
    pub fn dispatch_failure(detail: &str, scope: &AuthorizedScope) -> Self {
        Self {
            all_checks_passed: false,
            claimed_pass: false,
            blocking_issues: vec![format!("dispatch failure: {detail}")],
            pre_work_validation_passed: false,
            files_modified: Vec::new(),
            scope_files: scope.iter().map(str::to_string).collect(),
            payload: ValidatorPayload::default(),
            red_flags: Vec::new(),
            narrative: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn is_contradiction(&self) -> bool {
        self.claimed_pass && !self.red_flags.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedContract {
    pub missing: Vec<String>,
    pub invalid: Vec<String>,
}

impl MalformedContract {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    pub fn issue(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing {}", self.missing.join(", ")));
        }
        if !self.invalid.is_empty() {
            parts.push(format!("invalid {}", self.invalid.join(", ")));
        }
        if parts.is_empty() {
            return "malformed contract".to_string();
        }
        format!("malformed contract: {}", parts.join("; "))
    }
}

impl std::fmt::Display for MalformedContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.issue())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContractVerdict {
    Valid(GateResult),
    Malformed(MalformedContract),
}

impl ContractVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Valid(result) if result.all_checks_passed)
    }

    pub fn result(&self) -> Option<&GateResult> {
        match self {
            Self::Valid(result) => Some(result),
            Self::Malformed(_) => None,
        }
    }
}

/// Deterministic parser and red-flag detector for worker reports.
///
/// Stateless; a single instance is shared across every run.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContractValidator;

impl ContractValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        raw: &RawWorkerOutput,
        scope: &AuthorizedScope,
        spec: &ValidatorSpec,
    ) -> ContractVerdict {
        let obj = match unwrap_report(raw.as_value()) {
            Some(obj) => obj,
            None => {
                return ContractVerdict::Malformed(MalformedContract {
                    missing: Vec::new(),
                    invalid: vec!["report (expected JSON object)".to_string()],
                });
            }
        };

        let mut fields = ReportFields::new(&obj);
        let claimed_pass = fields.take_bool(&["all_checks_passed", "allChecksPassed"]);
        let issues = fields.take_strings(&["blocking_issues", "blockingIssues"]);
        let pre_work =
            fields.take_bool(&["pre_work_validation_passed", "preWorkValidationPassed"]);
        let files = fields.take_strings(&["files_modified", "filesModified"]);
        let failure_count = fields.take_optional_u64(&["failure_count", "failureCount"]);
        let commands = fields.take_optional_strings(&["commands_executed", "commandsExecuted"]);
        let (malformed, narrative, extensions) = fields.finish();

        let (Some(claimed_pass), Some(issues), Some(pre_work), Some(files)) =
            (claimed_pass, issues, pre_work, files)
        else {
            return ContractVerdict::Malformed(malformed);
        };
        if !malformed.is_empty() {
            return ContractVerdict::Malformed(malformed);
        }

        let payload = ValidatorPayload {
            failure_count,
            commands_executed: commands,
        };
        let red_flags = detect_red_flags(claimed_pass, pre_work, &files, &payload, scope, spec.expects);

        let mut blocking_issues = issues
            .into_iter()
            .map(|issue| issue.trim().to_string())
            .filter(|issue| !issue.is_empty())
            .collect::<Vec<_>>();
        if !claimed_pass && blocking_issues.is_empty() {
            blocking_issues.push("validator reported failure without blocking issues".to_string());
        }
        blocking_issues.extend(red_flags.iter().map(RedFlag::issue));

        ContractVerdict::Valid(GateResult {
            all_checks_passed: claimed_pass && red_flags.is_empty(),
            claimed_pass,
            blocking_issues,
            pre_work_validation_passed: pre_work,
            files_modified: files.iter().map(|f| normalize_path(f)).collect(),
            scope_files: scope.iter().map(str::to_string).collect(),
            payload,
            red_flags,
            narrative,
            extensions,
        })
    }
}

fn detect_red_flags(
    claimed_pass: bool,
    pre_work: bool,
    files: &[String],
    payload: &ValidatorPayload,
    scope: &AuthorizedScope,
    expects: ContractExpectations,
) -> Vec<RedFlag> {
    let mut flags = Vec::new();
    if !pre_work {
        flags.push(RedFlag::InvalidInputs);
    }
    if expects.failure_count
        && claimed_pass
        && let Some(count) = payload.failure_count
        && count > 0
    {
        flags.push(RedFlag::LogicalInconsistency {
            failure_count: count,
        });
    }
    let outside = scope.violations(files);
    if !outside.is_empty() {
        flags.push(RedFlag::ScopeViolation { paths: outside });
    }
    if expects.commands_executed
        && payload
            .commands_executed
            .as_ref()
            .is_none_or(|commands| commands.iter().all(|c| c.trim().is_empty()))
    {
        flags.push(RedFlag::MissingEvidence {
            field: "commands_executed".to_string(),
        });
    }
    flags
}

fn unwrap_report(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(obj) => match obj.get("structured_output") {
            Some(inner) => unwrap_report(inner),
            None => Some(obj.clone()),
        },
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(text.trim()).ok()?;
            if parsed.is_string() {
                return None;
            }
            unwrap_report(&parsed)
        }
        _ => None,
    }
}

/// Consumes known keys from a report object, collecting schema problems and
/// leaving everything else for the opaque extension map.
struct ReportFields {
    rest: Map<String, Value>,
    malformed: MalformedContract,
}

impl ReportFields {
    fn new(obj: &Map<String, Value>) -> Self {
        Self {
            rest: obj.clone(),
            malformed: MalformedContract::default(),
        }
    }

    fn take(&mut self, keys: &[&str]) -> Option<Value> {
        let mut found = None;
        for key in keys {
            if let Some(value) = self.rest.remove(*key)
                && found.is_none()
            {
                found = Some(value);
            }
        }
        found
    }

    fn take_required(&mut self, keys: &[&str]) -> Option<Value> {
        let value = self.take(keys);
        if value.is_none() {
            self.malformed.missing.push(keys[0].to_string());
        }
        value
    }

    fn take_bool(&mut self, keys: &[&str]) -> Option<bool> {
        let value = self.take_required(keys)?;
        match value.as_bool() {
            Some(v) => Some(v),
            None => {
                self.malformed.invalid.push(format!("{} (expected bool)", keys[0]));
                None
            }
        }
    }

    fn take_strings(&mut self, keys: &[&str]) -> Option<Vec<String>> {
        let value = self.take_required(keys)?;
        self.strings_from(value, keys[0])
    }

    fn take_optional_strings(&mut self, keys: &[&str]) -> Option<Vec<String>> {
        let value = self.take(keys)?;
        if value.is_null() {
            return None;
        }
        self.strings_from(value, keys[0])
    }

    fn take_optional_u64(&mut self, keys: &[&str]) -> Option<u64> {
        let value = self.take(keys)?;
        if value.is_null() {
            return None;
        }
        match value.as_u64() {
            Some(v) => Some(v),
            None => {
                self.malformed
                    .invalid
                    .push(format!("{} (expected non-negative integer)", keys[0]));
                None
            }
        }
    }

    fn strings_from(&mut self, value: Value, field: &str) -> Option<Vec<String>> {
        let Some(items) = value.as_array() else {
            self.malformed.invalid.push(format!("{field} (expected array)"));
            return None;
        };
        let mut out = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(s) => out.push(s.to_string()),
                None => {
                    self.malformed
                        .invalid
                        .push(format!("{field}[{idx}] (expected string)"));
                    return None;
                }
            }
        }
        Some(out)
    }

    fn finish(mut self) -> (MalformedContract, Option<String>, BTreeMap<String, Value>) {
        let mut narrative = Vec::new();
        for key in NARRATIVE_KEYS {
            if let Some(value) = self.rest.remove(*key) {
                match value {
                    Value::String(text) if !text.trim().is_empty() => narrative.push(text),
                    Value::String(_) | Value::Null => {}
                    other => narrative.push(other.to_string()),
                }
            }
        }
        let narrative = if narrative.is_empty() {
            None
        } else {
            Some(narrative.join("\n"))
        };
        (
            self.malformed,
            narrative,
            self.rest.into_iter().collect(),
        )
    }
}
