//! Prompt rendering and model-output parsing for memory passes.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use la_domain::message::LedgerMessage;

/// Parsed result of one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub summary: String,
    pub key_facts: Vec<String>,
    /// True when the model output held no usable JSON block and the raw
    /// text was kept as the summary.
    pub fallback: bool,
}

#[derive(Deserialize)]
struct ExtractionBlock {
    #[serde(default)]
    summary: String,
    #[serde(default, rename = "keyFacts", alias = "key_facts")]
    key_facts: Vec<String>,
}

/// Render ledger records as plain dialogue, one `Role: text` line each.
///
/// Records longer than `max_line_chars` keep their head and tail.
pub fn render_dialogue(records: &[LedgerMessage], max_line_chars: usize) -> String {
    let mut buf = String::new();
    for rec in records {
        buf.push_str(rec.role.label());
        buf.push_str(": ");
        buf.push_str(&clip(rec.text.trim(), max_line_chars));
        buf.push('\n');
    }
    buf
}

fn clip(text: &str, max_chars: usize) -> String {
    let len = text.chars().count();
    if max_chars == 0 || len <= max_chars {
        return text.to_string();
    }
    let head = max_chars / 2;
    let tail = max_chars / 4;
    let head_str: String = text.chars().take(head).collect();
    let tail_str: String = text.chars().skip(len - tail).collect();
    format!("{head_str} [...] {tail_str}")
}

pub fn extraction_prompt(dialogue: &str) -> String {
    format!(
        "You maintain the long-term memory of a conversation. Read the new \
         conversation segment below and return a JSON object with:\n\
         - \"summary\": a short paragraph of what happened, in present tense\n\
         - \"keyFacts\": an array of durable facts worth remembering (user \
         preferences, decisions, names, open tasks)\n\n\
         Omit greetings and small talk. Respond with the JSON object only.\n\n\
         CONVERSATION:\n{dialogue}"
    )
}

pub fn compression_prompt(record: &str, target_chars: usize) -> String {
    format!(
        "The following is a running memory record for one conversation. \
         Rewrite it to at most {target_chars} characters. Merge duplicate \
         facts, drop details that were superseded, and keep every decision, \
         preference and open task. Keep Markdown headings and bullet lists. \
         Respond with the rewritten record only.\n\n\
         MEMORY:\n{record}"
    )
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("static regex is valid")
    })
}

/// Parse the model's reply.  Tries a fenced ```json block first, then the
/// outermost `{ ... }` span; anything else becomes a raw-text summary.
pub fn parse_extraction(raw: &str) -> Extraction {
    let candidates = fenced_json()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .into_iter()
        .chain(outer_braces(raw));

    for candidate in candidates {
        if let Ok(block) = serde_json::from_str::<ExtractionBlock>(candidate) {
            let summary = block.summary.trim().to_string();
            let key_facts: Vec<String> = block
                .key_facts
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if summary.is_empty() && key_facts.is_empty() {
                continue;
            }
            return Extraction {
                summary,
                key_facts,
                fallback: false,
            };
        }
    }

    Extraction {
        summary: raw.trim().to_string(),
        key_facts: Vec::new(),
        fallback: true,
    }
}

fn outer_braces(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
