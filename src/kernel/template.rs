//! Template resolution for step parameters.
//!
//! Two recognized forms inside parameter values:
//! - **Direct reference**: the entire string equals `$stepN.<path>`; the
//!   result is the referenced JSON value, type preserved.
//! - **Inline template**: the string contains `{$stepN.<path>}` occurrences;
//!   each is replaced by the string rendering of its target.
//!
//! Resolution failures are non-fatal: unresolved inline placeholders stay
//! verbatim, unresolved direct references yield `null`, and a warning is
//! emitted. Only syntactically ill-formed references raise [`TemplateError`].

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

/// Prefix shared by both reference forms.
const REF_PREFIX: &str = "$step";

/// Opening marker of an inline placeholder.
const INLINE_OPEN: &str = "{$step";

/// Template resolution errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A reference matched the template shape but violates the grammar.
    #[error("malformed template reference '{reference}': {reason}")]
    Malformed {
        /// The offending reference text.
        reference: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Step payloads available for resolution, keyed by step id.
pub type StepPayloads = BTreeMap<u32, serde_json::Value>;

/// A parsed `$stepN.<path>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StepRef {
    step_id: u32,
    path: Vec<String>,
}

/// Resolve all template references in `value` against `payloads`.
///
/// Objects and arrays are resolved element-wise; non-string scalars pass
/// through unchanged.
///
/// # Errors
///
/// Returns [`TemplateError`] only for syntactically ill-formed references.
pub fn resolve(
    value: &serde_json::Value,
    payloads: &StepPayloads,
) -> Result<serde_json::Value, TemplateError> {
    match value {
        serde_json::Value::String(s) => resolve_string(s, payloads),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, payloads)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, payloads)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Collect the step ids referenced by any template form inside `value`.
///
/// Ill-formed references are ignored here; the resolver reports them at
/// resolution time.
pub fn referenced_steps(value: &serde_json::Value, out: &mut Vec<u32>) {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(Some(step_ref)) = parse_direct(s) {
                out.push(step_ref.step_id);
            }
            let mut rest = s.as_str();
            while let Some(pos) = rest.find(INLINE_OPEN) {
                let Some(after) = pos.checked_add(1).and_then(|p| rest.get(p..)) else {
                    break;
                };
                if let Some(end) = after.find('}') {
                    if let Some(inner) = after.get(..end) {
                        if let Ok(Some(step_ref)) = parse_direct(inner) {
                            out.push(step_ref.step_id);
                        }
                    }
                    rest = after.get(end..).unwrap_or("");
                } else {
                    break;
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                referenced_steps(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                referenced_steps(v, out);
            }
        }
        _ => {}
    }
}

// ── String resolution ───────────────────────────────────────────

fn resolve_string(
    s: &str,
    payloads: &StepPayloads,
) -> Result<serde_json::Value, TemplateError> {
    // Direct form: the whole string is one reference; type is preserved.
    if let Some(step_ref) = parse_direct(s)? {
        return Ok(match lookup(&step_ref, payloads) {
            Some(v) => v.clone(),
            None => {
                warn!(reference = %s, "unresolved direct template reference");
                serde_json::Value::Null
            }
        });
    }

    // Inline form: replace each `{$stepN.path}` occurrence.
    if s.contains(INLINE_OPEN) {
        return Ok(serde_json::Value::String(resolve_inline(s, payloads)?));
    }

    Ok(serde_json::Value::String(s.to_owned()))
}

/// Substitute inline placeholders, leaving unresolvable ones verbatim.
fn resolve_inline(s: &str, payloads: &StepPayloads) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find(INLINE_OPEN) {
        out.push_str(rest.get(..open).unwrap_or(""));
        let after_brace = open
            .checked_add(1)
            .and_then(|p| rest.get(p..))
            .unwrap_or("");

        let Some(close) = after_brace.find('}') else {
            return Err(TemplateError::Malformed {
                reference: rest.get(open..).unwrap_or(rest).to_owned(),
                reason: "unterminated inline placeholder".to_owned(),
            });
        };

        let inner = after_brace.get(..close).unwrap_or("");
        let step_ref = parse_direct(inner)?.ok_or_else(|| TemplateError::Malformed {
            reference: inner.to_owned(),
            reason: "inline placeholder is not a step reference".to_owned(),
        })?;

        match lookup(&step_ref, payloads) {
            Some(v) => out.push_str(&render(v)),
            None => {
                warn!(reference = %inner, "unresolved inline template reference");
                // Keep the placeholder verbatim, braces included.
                out.push('{');
                out.push_str(inner);
                out.push('}');
            }
        }

        rest = after_brace
            .get(close.checked_add(1).unwrap_or(close)..)
            .unwrap_or("");
    }

    out.push_str(rest);
    Ok(out)
}

/// String rendering of a resolved value for inline substitution.
///
/// Scalars render naturally (strings unquoted); arrays and objects are
/// JSON-serialized.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

// ── Reference grammar ───────────────────────────────────────────

/// Parse a whole string as a `$stepN.<path>` reference.
///
/// Returns `Ok(None)` when the string is not a reference at all,
/// `Ok(Some(_))` for a well-formed reference, and an error when the string
/// starts like a reference but violates the grammar (missing step number,
/// empty path segment).
fn parse_direct(s: &str) -> Result<Option<StepRef>, TemplateError> {
    let Some(rest) = s.strip_prefix(REF_PREFIX) else {
        return Ok(None);
    };

    let digits_len = rest.chars().take_while(char::is_ascii_digit).count();
    if digits_len == 0 {
        return Err(TemplateError::Malformed {
            reference: s.to_owned(),
            reason: "expected a step number after '$step'".to_owned(),
        });
    }

    let digits = rest.get(..digits_len).unwrap_or("");
    let step_id: u32 = digits.parse().map_err(|_| TemplateError::Malformed {
        reference: s.to_owned(),
        reason: "step number out of range".to_owned(),
    })?;

    let path_part = rest.get(digits_len..).unwrap_or("");
    if path_part.is_empty() {
        return Ok(Some(StepRef {
            step_id,
            path: Vec::new(),
        }));
    }

    let Some(path_body) = path_part.strip_prefix('.') else {
        // `$step1foo` and similar: not a reference, plain text.
        return Ok(None);
    };

    let mut path = Vec::new();
    for segment in path_body.split('.') {
        if segment.is_empty() {
            return Err(TemplateError::Malformed {
                reference: s.to_owned(),
                reason: "empty path segment".to_owned(),
            });
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            // Invalid segment characters mean this is ordinary text.
            return Ok(None);
        }
        path.push(segment.to_owned());
    }

    Ok(Some(StepRef { step_id, path }))
}

/// Walk the reference path through the step's payload.
fn lookup<'a>(step_ref: &StepRef, payloads: &'a StepPayloads) -> Option<&'a serde_json::Value> {
    let mut current = payloads.get(&step_ref.step_id)?;
    for segment in &step_ref.path {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
