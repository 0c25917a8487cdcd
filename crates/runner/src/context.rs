#![forbid(unsafe_code)]

use gate_core::{ChangesetId, ValidatorSpec};

pub(crate) const MAX_PRIOR_ISSUES: usize = 12;
pub(crate) const MAX_ISSUE_CHARS: usize = 240;

pub(crate) fn sanitize_single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>()
}

pub(crate) fn truncate_line(text: &str, max_chars: usize) -> String {
    let sanitized = sanitize_single_line(text).trim().to_string();
    if sanitized.chars().count() <= max_chars {
        return sanitized;
    }
    let mut out = sanitized
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('\u{2026}');
    out
}

/// Single-lined, truncated, capped at [`MAX_PRIOR_ISSUES`] with an overflow marker.
pub(crate) fn bounded_issues(issues: &[String]) -> Vec<String> {
    let mut out = issues
        .iter()
        .map(|issue| truncate_line(issue, MAX_ISSUE_CHARS))
        .filter(|issue| !issue.is_empty())
        .collect::<Vec<_>>();
    if out.len() > MAX_PRIOR_ISSUES {
        let hidden = out.len() - MAX_PRIOR_ISSUES;
        out.truncate(MAX_PRIOR_ISSUES);
        out.push(format!("(+{hidden} more)"));
    }
    out
}

/// Text handed to a resumed worker session.
pub(crate) fn supplemental_context(
    changeset_id: &ChangesetId,
    spec: &ValidatorSpec,
    attempt_number: u32,
    prior_issues: &[String],
) -> String {
    let mut out = format!(
        "RETRY CONTEXT (validator `{}`, changeset `{}`, attempt {} of {}):\n\
         The previous attempt did not pass. Unresolved blocking issues:\n",
        spec.name, changeset_id, attempt_number, spec.max_attempts
    );
    let issues = bounded_issues(prior_issues);
    if issues.is_empty() {
        out.push_str("- (none reported)\n");
    }
    for issue in issues {
        out.push_str("- ");
        out.push_str(&issue);
        out.push('\n');
    }
    out.push_str("Fix what is in scope, re-run your checks, and report the full contract again.\n");
    out
}
