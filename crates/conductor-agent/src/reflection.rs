//! Output reflection: deterministic quality checks plus a bounded
//! self-correction loop backed by an [`InferenceClient`].
//!
//! Three checks run on every candidate output:
//!
//! - **schema**: required fields, primitive types and numeric ranges;
//! - **consistency**: sentences carrying factual markers (numbers, proper
//!   nouns) must be grounded in the node input or graph context;
//! - **completeness**: required sections and a minimum length.
//!
//! When any check fails, the flawed output and the issues are sent back
//! for correction, up to `max_iterations` times.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use conductor_core::config::ReflectionConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::schema::OutputSchema;
use conductor_core::traits::InferenceClient;
use conductor_core::types::{Payload, QualityFlag};

const MAX_PROMPT_CONTEXT_CHARS: usize = 4_000;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "because", "been", "before", "being", "between", "could", "does",
    "during", "each", "from", "have", "having", "into", "more", "most", "other", "over", "same",
    "should", "some", "such", "than", "that", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "under", "until", "very", "were", "what", "when", "where",
    "which", "while", "will", "with", "would", "your",
];

/// Everything the validator needs to judge one node output.
#[derive(Debug, Clone, Copy)]
pub struct ReflectionRequest<'a> {
    pub capability: &'a str,
    pub input: &'a Payload,
    /// Graph state at the time the node ran.
    pub context: &'a Payload,
    pub schema: Option<&'a OutputSchema>,
    pub instructions: Option<&'a str>,
}

/// Result of `validate_and_correct`.
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    /// True only when `issues` is empty.
    pub valid: bool,
    pub output: Payload,
    /// Issues still outstanding on `output`.
    pub issues: Vec<String>,
    /// Issues from the original candidate fixed by correction.
    pub resolved: Vec<String>,
    /// Correction rounds performed.
    pub iterations: usize,
}

impl ReflectionOutcome {
    pub fn quality(&self) -> QualityFlag {
        match (self.valid, self.iterations) {
            (true, 0) => QualityFlag::Clean,
            (true, iterations) => QualityFlag::Corrected {
                iterations,
                resolved: self.resolved.clone(),
            },
            (false, iterations) => QualityFlag::Unresolved {
                iterations,
                issues: self.issues.clone(),
            },
        }
    }

    /// The corrected output, or `ValidationUnresolved`.
    pub fn into_result(self) -> Result<Payload> {
        if self.valid {
            Ok(self.output)
        } else {
            Err(ConductorError::ValidationUnresolved {
                iterations: self.iterations,
                issues: self.issues,
            })
        }
    }

    /// Envelope written to state under `_quality.<node_id>`.
    pub fn envelope(&self) -> Value {
        serde_json::json!({
            "valid": self.valid,
            "issues": self.issues,
            "iterations": self.iterations,
        })
    }
}

pub struct ReflectionValidator {
    inference: Option<Arc<dyn InferenceClient>>,
    config: ReflectionConfig,
}

impl ReflectionValidator {
    pub fn new(inference: Arc<dyn InferenceClient>, config: ReflectionConfig) -> Self {
        Self {
            inference: Some(inference),
            config,
        }
    }

    /// Checks only; failing outputs are flagged without correction.
    pub fn checks_only(config: ReflectionConfig) -> Self {
        Self {
            inference: None,
            config,
        }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    /// Check a candidate output and try to correct it until it passes or
    /// the correction budget runs out.
    pub async fn validate_and_correct(
        &self,
        request: ReflectionRequest<'_>,
        candidate: Payload,
    ) -> ReflectionOutcome {
        let original_issues = self.check(&request, &candidate);
        if original_issues.is_empty() {
            return ReflectionOutcome {
                valid: true,
                output: candidate,
                issues: vec![],
                resolved: vec![],
                iterations: 0,
            };
        }

        debug!(
            capability = request.capability,
            issues = original_issues.len(),
            "Reflection found issues"
        );

        let mut output = candidate;
        let mut issues = original_issues.clone();
        let mut iterations = 0;

        if let Some(inference) = &self.inference {
            while iterations < self.config.max_iterations {
                iterations += 1;
                let prompt = correction_prompt(&request, &output, &issues);
                let text = match inference.generate(prompt).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            capability = request.capability,
                            iteration = iterations,
                            error = %e,
                            "Correction request failed"
                        );
                        break;
                    }
                };

                let Some(corrected) = parse_payload(&text) else {
                    warn!(
                        capability = request.capability,
                        iteration = iterations,
                        "Correction was not a JSON object"
                    );
                    continue;
                };

                output = corrected;
                issues = self.check(&request, &output);
                if issues.is_empty() {
                    info!(
                        capability = request.capability,
                        iterations, "Reflection corrected output"
                    );
                    break;
                }
            }
        }

        let resolved = original_issues
            .into_iter()
            .filter(|i| !issues.contains(i))
            .collect();

        if !issues.is_empty() {
            warn!(
                capability = request.capability,
                iterations,
                issues = %issues.join("; "),
                "Reflection left issues unresolved"
            );
        }

        ReflectionOutcome {
            valid: issues.is_empty(),
            output,
            issues,
            resolved,
            iterations,
        }
    }

    /// Run every check; an empty result means the output passes.
    pub fn check(&self, request: &ReflectionRequest<'_>, output: &Payload) -> Vec<String> {
        let mut issues = Vec::new();
        if let Some(schema) = request.schema {
            issues.extend(check_schema(schema, output));
        }
        issues.extend(self.check_consistency(request, output));
        issues.extend(self.check_completeness(request.schema, output));
        issues
    }

    fn check_consistency(&self, request: &ReflectionRequest<'_>, output: &Payload) -> Vec<String> {
        let mut sources = String::new();
        collect_text(&payload_value(request.input), &mut sources, true);
        collect_text(&payload_value(request.context), &mut sources, true);
        if sources.trim().is_empty() {
            return vec![];
        }

        let source_terms: HashSet<String> = terms(&sources).into_iter().collect();
        let source_numbers: HashSet<String> = numbers_in(&sources).into_iter().collect();
        let mut text = String::new();
        collect_text(&payload_value(output), &mut text, false);

        let mut issues = Vec::new();
        for sentence in sentences(&text) {
            let numbers = numbers_in(sentence);
            if numbers.is_empty() && !has_proper_noun(sentence) {
                continue;
            }

            for n in &numbers {
                if !source_numbers.contains(n) {
                    issues.push(format!("number {} does not appear in the sources", n));
                }
            }

            let salient = terms(sentence);
            if salient.is_empty() {
                continue;
            }
            let supported = salient.iter().filter(|t| source_terms.contains(*t)).count();
            let support = supported as f64 / salient.len() as f64;
            if support < self.config.support_threshold {
                issues.push(format!(
                    "unsupported claim ({:.0}% of terms grounded): \"{}\"",
                    support * 100.0,
                    sentence
                ));
            }
        }
        issues
    }

    fn check_completeness(&self, schema: Option<&OutputSchema>, output: &Payload) -> Vec<String> {
        let mut issues = Vec::new();
        if output.is_empty() {
            issues.push("output is empty".to_string());
            return issues;
        }

        let mut text = String::new();
        collect_text(&payload_value(output), &mut text, false);
        let lowered = text.to_lowercase();

        if let Some(schema) = schema {
            for section in &schema.required_sections {
                let in_text = lowered.contains(&section.to_lowercase());
                let as_key = output.contains_key(section);
                if !in_text && !as_key {
                    issues.push(format!("missing required section '{}'", section));
                }
            }
        }

        let floor = schema
            .and_then(|s| s.min_length)
            .unwrap_or(self.config.min_output_chars);
        let length = if text.trim().is_empty() {
            serde_json::to_string(output).map(|s| s.len()).unwrap_or(0)
        } else {
            text.trim().chars().count()
        };
        if length < floor {
            issues.push(format!("output too short: {} < {} characters", length, floor));
        }
        issues
    }
}

fn check_schema(schema: &OutputSchema, output: &Payload) -> Vec<String> {
    let mut issues = Vec::new();
    for field in &schema.fields {
        match output.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    issues.push(format!("missing required field '{}'", field.name));
                }
            }
            Some(value) => {
                if !field.field_type.matches(value) {
                    issues.push(format!(
                        "field '{}' should be {}",
                        field.name,
                        field.field_type.as_str()
                    ));
                    continue;
                }
                if let (Some((min, max)), Some(n)) = (field.range, value.as_f64()) {
                    if n < min || n > max {
                        issues.push(format!(
                            "field '{}' = {} outside [{}, {}]",
                            field.name, n, min, max
                        ));
                    }
                }
            }
        }
    }
    issues
}

fn payload_value(payload: &Payload) -> Value {
    Value::Object(payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Flatten every string (and optionally every number) in a JSON value
/// into `out`, one per line.
fn collect_text(value: &Value, out: &mut String, numbers: bool) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push('\n');
        }
        Value::Number(n) if numbers => {
            out.push_str(&n.to_string());
            out.push('\n');
        }
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out, numbers)),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                if let Some(v) = map.get(k) {
                    collect_text(v, out, numbers);
                }
            }
        }
        _ => {}
    }
}

fn sentences(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let bytes: Vec<(usize, char)> = text.char_indices().collect();
    for (idx, &(pos, c)) in bytes.iter().enumerate() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => bytes
                .get(idx + 1)
                .map_or(true, |&(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let s = text[start..pos + c.len_utf8()].trim();
            if !s.is_empty() {
                result.push(s);
            }
            start = pos + c.len_utf8();
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        result.push(tail);
    }
    result
}

fn number_re() -> Option<&'static Regex> {
    static NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBER
        .get_or_init(|| Regex::new(r"\d+(?:[.,]\d+)*").ok())
        .as_ref()
}

fn numbers_in(sentence: &str) -> Vec<String> {
    number_re()
        .map(|re| re.find_iter(sentence).map(|m| m.as_str().to_string()).collect())
        .unwrap_or_default()
}

/// A capitalized word anywhere but the first position.
fn has_proper_noun(sentence: &str) -> bool {
    sentence
        .split_whitespace()
        .skip(1)
        .any(|w| w.chars().next().is_some_and(|c| c.is_uppercase()) && w.len() > 1)
}

/// Lowercased salient terms: words of four or more letters that are not
/// stopwords, plus numbers.
fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| {
            w.chars().all(|c| c.is_ascii_digit())
                || (w.chars().count() >= 4 && !STOPWORDS.contains(&w.as_str()))
        })
        .collect()
}

fn correction_prompt(request: &ReflectionRequest<'_>, output: &Payload, issues: &[String]) -> String {
    let input = serde_json::to_string_pretty(request.input).unwrap_or_default();
    let flawed = serde_json::to_string_pretty(output).unwrap_or_default();
    let context = truncate(
        &serde_json::to_string(request.context).unwrap_or_default(),
        MAX_PROMPT_CONTEXT_CHARS,
    );
    let instructions = request
        .instructions
        .map(|i| format!("\nAdditional instructions:\n{}\n", i))
        .unwrap_or_default();

    format!(
        r#"You are correcting the output of the '{}' capability.

Input:
{}

Output with issues:
{}

Issues:
- {}

Context:
{}
{}
Fix every issue. Only state facts supported by the input or context. Return ONLY the corrected output as a JSON object, nothing else."#,
        request.capability,
        input,
        flawed,
        issues.join("\n- "),
        context,
        instructions,
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Extract a JSON object from a model response, tolerating code fences
/// and surrounding prose.
fn parse_payload(text: &str) -> Option<Payload> {
    let body = strip_code_fences(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&body[start..=end]).ok()? {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on the fence line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}
