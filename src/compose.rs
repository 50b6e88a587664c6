//! # Document Composition
//!
//! Substitutes resolved tokens into template HTML and CSS. This is pure
//! text replacement: no conditionals, no loops, no re-escaping (the
//! resolver already sanitized every value).
//!
//! The scanner makes a single pass over the template text. Replacement
//! values are appended to the output and never rescanned, so substitution
//! is order-independent and a value containing `{{...}}` text stays
//! literal. Token-shaped spans missing from the map substitute to the
//! empty string; malformed spans pass through unchanged.

use crate::error::LibritoError;
use crate::template::Template;
use crate::tokens::TokenMap;

/// Longest accepted token name between the braces.
const MAX_TOKEN_LEN: usize = 64;

/// A template with all tokens substituted, ready for PDF rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedDocument {
    pub html: String,
    pub css: String,
}

impl ComposedDocument {
    /// Single-string preview form: a `<style>` block followed by the body.
    pub fn preview_html(&self) -> String {
        format!("<style>{}</style>{}", self.css, self.html)
    }
}

/// Substitute `tokens` into a template's HTML and CSS.
///
/// Fails with a data error when the token map is empty (the entity could
/// not be resolved). In strict mode an empty HTML or CSS body is a content
/// error: builds must not proceed on a gutted template, while previews
/// may.
pub fn compose(
    tokens: &TokenMap,
    template: &Template,
    strict: bool,
) -> Result<ComposedDocument, LibritoError> {
    if tokens.is_empty() {
        return Err(LibritoError::Data(
            "No tokens resolved; entity is missing or not a serialnumber".to_string(),
        ));
    }

    if strict {
        if template.html.trim().is_empty() {
            return Err(LibritoError::Content(format!(
                "Template '{}' has no HTML body",
                template.id
            )));
        }
        if template.css.trim().is_empty() {
            return Err(LibritoError::Content(format!(
                "Template '{}' has no CSS body",
                template.id
            )));
        }
    }

    Ok(ComposedDocument {
        html: substitute(&template.html, tokens),
        css: substitute(&template.css, tokens),
    })
}

/// Replace every `{{name}}` span in `text` with its value from `tokens`.
///
/// Single pass: output is never rescanned. Unknown tokens become "",
/// malformed spans (unterminated, bad characters, overlong) stay literal.
pub fn substitute(text: &str, tokens: &TokenMap) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{')
            && let Some(span_end) = scan_token(bytes, i + 2)
        {
            out.push_str(&text[literal_start..i]);
            let key = &text[i..span_end];
            if let Some(value) = tokens.get(key) {
                out.push_str(value);
            }
            literal_start = span_end;
            i = span_end;
            continue;
        }
        i += 1;
    }

    out.push_str(&text[literal_start..]);
    out
}

/// Scan a token body starting just after `{{`.
///
/// Accepts 1..=64 characters of `[A-Za-z0-9_-]` terminated by `}}`.
/// Returns the index just past the closing braces.
fn scan_token(bytes: &[u8], start: usize) -> Option<usize> {
    let mut end = start;
    while end < bytes.len() && is_token_char(bytes[end]) {
        end += 1;
    }
    let len = end - start;
    if len == 0 || len > MAX_TOKEN_LEN {
        return None;
    }
    if bytes.get(end) == Some(&b'}') && bytes.get(end + 1) == Some(&b'}') {
        Some(end + 2)
    } else {
        None
    }
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

// ============================================================================
// TESTS
// ============================================================================
