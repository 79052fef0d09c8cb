//! Prompt construction and tolerant parsing of structured fix responses

use serde::Deserialize;

use super::types::FixProposal;
use crate::language::Language;

/// Longest slice of a remote body quoted in an error message
const MAX_ERROR_EXCERPT: usize = 200;

/// Build the fix prompt. `with_confidence` asks for a `confidence` field too.
pub fn build_prompt(language: Language, code: &str, error: &str, with_confidence: bool) -> String {
    let schema = if with_confidence {
        "{\n  \"explanation\": \"Brief explanation of the issue and fix\",\n  \"fixed_code\": \"Complete corrected code\",\n  \"confidence\": 0.95\n}"
    } else {
        "{\n  \"explanation\": \"Brief explanation of the issue and fix\",\n  \"fixed_code\": \"Complete corrected code\"\n}"
    };

    let mut prompt = format!(
        "You are an expert {} debugger.\n\nUser code:\n{}\n\nError:\n{}\n\nRespond ONLY with valid JSON in this format:\n{}\n",
        language.display_name(),
        code,
        error,
        schema
    );
    if with_confidence {
        prompt.push_str(
            "\nThe confidence field should be a float between 0.0 and 1.0 indicating your certainty about the fix.\n",
        );
    }
    prompt.push_str("Do not include markdown or extra text.\n");
    prompt
}

#[derive(Deserialize)]
struct RawFix {
    #[serde(default)]
    explanation: Option<String>,
    fixed_code: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse model output into a proposal. Never fails: unparseable output
/// becomes an unusable proposal whose explanation says what went wrong.
pub fn parse_proposal(provider: &str, content: &str) -> FixProposal {
    let mut last_err = None;
    for candidate in candidates(content) {
        match serde_json::from_str::<RawFix>(&candidate) {
            Ok(raw) => {
                return FixProposal {
                    explanation: raw.explanation.unwrap_or_default().trim().to_string(),
                    fixed_code: strip_fences(&raw.fixed_code).unwrap_or(raw.fixed_code),
                    confidence: raw.confidence.and_then(clamp_confidence),
                };
            }
            Err(e) => last_err = Some(e.to_string()),
        }
    }

    FixProposal::unusable(format!(
        "Failed to parse {} response: {}",
        provider,
        last_err.unwrap_or_else(|| "empty response".to_string())
    ))
}

/// Raw text, the text without markdown fences, then the first balanced JSON object
fn candidates(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() && !out.iter().any(|c| c == trimmed) {
            out.push(trimmed.to_string());
        }
    };

    push(content.to_string());
    if let Some(stripped) = strip_fences(content) {
        push(stripped);
    }
    if let Some(start) = content.find('{') {
        if let Some(object) = balanced_object(content, start) {
            push(object);
        }
    }
    out
}

fn strip_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let without_open = trimmed.strip_prefix("```")?;
    let body = match without_open.find('\n') {
        Some(idx) => &without_open[idx + 1..],
        None => without_open,
    };
    let end = body.rfind("```")?;
    Some(body[..end].trim_end().to_string())
}

/// The `{...}` starting at `start`, honouring strings and escapes
fn balanced_object(content: &str, start: usize) -> Option<String> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn clamp_confidence(value: f64) -> Option<f32> {
    value.is_finite().then(|| value.clamp(0.0, 1.0) as f32)
}

/// Short excerpt of a remote error body, safe to log
pub fn error_excerpt(body: &str) -> String {
    let lowered = body.to_lowercase();
    if ["api_key", "apikey", "bearer", "secret"]
        .iter()
        .any(|p| lowered.contains(p))
    {
        return "(response body redacted)".to_string();
    }
    match body.char_indices().nth(MAX_ERROR_EXCERPT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
