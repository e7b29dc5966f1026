//! Documentation parsing for in-process operations.
//!
//! Tool and parameter descriptions come from the free-form documentation an
//! operation declares. Two conventions are understood:
//!
//! ```text
//! Add two numbers.               Add two numbers.
//!
//! Args:                          # Arguments
//!     a (int): first addend      * `a` - first addend
//!     b: second addend           * `b` - second addend
//!
//! Returns:                       # Returns
//!     the sum                    the sum
//! ```

use std::collections::HashMap;

/// Extracted tool description and per-parameter descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDoc {
    /// First non-empty line of the documentation.
    pub description: Option<String>,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Summary,
    Params,
    Other,
}

pub fn parse_doc(doc: &str) -> ParsedDoc {
    let mut parsed = ParsedDoc::default();
    let mut section = Section::Summary;
    let mut current: Option<String> = None;

    for raw in doc.lines() {
        let line = raw.trim();

        if let Some(next) = section_header(line) {
            section = next;
            current = None;
            continue;
        }

        match section {
            Section::Summary => {
                if parsed.description.is_none() && !line.is_empty() {
                    parsed.description = Some(line.to_string());
                }
            }
            Section::Params => {
                if let Some((name, text)) = parse_param_line(line) {
                    parsed.params.insert(name.clone(), text);
                    current = Some(name);
                } else if !line.is_empty() {
                    // Continuation of the previous parameter's description.
                    if let Some(text) = current.as_ref().and_then(|n| parsed.params.get_mut(n)) {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(line);
                    }
                }
            }
            Section::Other => {}
        }
    }

    parsed
}

fn section_header(line: &str) -> Option<Section> {
    let (heading, markdown) = if let Some(rest) = line.strip_prefix('#') {
        (rest.trim_start_matches('#').trim(), true)
    } else if let Some(rest) = line.strip_suffix(':') {
        (rest.trim(), false)
    } else {
        return None;
    };

    match heading.to_ascii_lowercase().as_str() {
        "args" | "arguments" | "parameters" | "params" => Some(Section::Params),
        "returns" | "return" | "yields" | "raises" | "errors" | "panics" | "examples"
        | "example" | "safety" | "notes" | "note" => Some(Section::Other),
        // Any other markdown heading ends the parameter section.
        _ if markdown => Some(Section::Other),
        _ => None,
    }
}

/// `name (type): text`, `name: text`, `` * `name` - text `` or `- name: text`.
fn parse_param_line(line: &str) -> Option<(String, String)> {
    let line = line
        .strip_prefix("* ")
        .or_else(|| line.strip_prefix("- "))
        .unwrap_or(line)
        .trim_start();

    if let Some(rest) = line.strip_prefix('`') {
        let (name, tail) = rest.split_once('`')?;
        if !is_identifier(name) {
            return None;
        }
        let text = tail.trim_start_matches([' ', '-', ':', '\u{2013}']).trim();
        return Some((name.to_string(), text.to_string()));
    }

    let name_len = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(line.len());
    let name = &line[..name_len];
    if !is_identifier(name) {
        return None;
    }

    let mut rest = line[name_len..].trim_start();
    if let Some(annotated) = rest.strip_prefix('(') {
        let close = annotated.find(')')?;
        rest = annotated[close + 1..].trim_start();
    }
    let text = rest.strip_prefix(':')?.trim();
    if text.is_empty() {
        return None;
    }
    Some((name.to_string(), text.to_string()))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
