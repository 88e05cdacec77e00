//! turns answer text with inline `[key]` markers into sanitized html plus the
//! ordered list of citations it actually uses.

use crate::model::{DataPoints, DocumentRecord, Exchange};
use html_escape::encode_double_quoted_attribute;
use std::fmt::Write;

/// render-ready form of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedAnswer {
    /// sanitized html; the only markup the parser adds is one citation anchor
    /// per recognized marker.
    pub html: String,
    /// keys in first-occurrence order, no duplicates. only keys that were both
    /// referenced and present in the data points.
    pub citations: Vec<String>,
    /// while streaming, a trailing `[token` that may still become a marker.
    /// it is rendered as plain text either way.
    pub pending: Option<String>,
}

impl ParsedAnswer {
    /// resolves the 1-based index shown in a citation anchor back to its key.
    pub fn citation_key(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.citations.get(i))
            .map(String::as_str)
    }

    /// `(index, key, record)` for each citation, for a references list.
    pub fn references<'a>(
        &'a self,
        data_points: &'a DataPoints,
    ) -> impl Iterator<Item = (usize, &'a str, &'a DocumentRecord)> + 'a {
        self.citations
            .iter()
            .enumerate()
            .filter_map(|(i, key)| data_points.get(key).map(|rec| (i + 1, key.as_str(), rec)))
    }
}

impl Exchange {
    /// parses the answer; partial while the exchange is still in flight.
    pub fn parsed(&self) -> ParsedAnswer {
        parse_answer(
            &self.answer.content,
            &self.answer.context.data_points,
            self.status.is_in_flight(),
        )
    }
}

/// scans `text` once, left to right.
///
/// `[key]` becomes a clickable reference when `key` exists verbatim in
/// `data_points`; any other bracket syntax stays literal text. with
/// `is_partial` set, an unterminated marker at the end is reported in
/// `pending` and otherwise treated as ordinary trailing text.
///
/// pure and deterministic: call it again on every content change.
pub fn parse_answer(text: &str, data_points: &DataPoints, is_partial: bool) -> ParsedAnswer {
    let mut html = String::with_capacity(text.len() + 64);
    let mut citations: Vec<String> = Vec::new();
    let mut pending = None;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('[') {
        let open = cursor + offset;
        html.push_str(&text[cursor..open]);

        let after = &text[open + 1..];
        match after.find(['[', ']']) {
            Some(close) if after[close..].starts_with(']') => {
                let key = &after[..close];
                match data_points.get(key) {
                    Some(record) if !key.is_empty() => {
                        let index = match citations.iter().position(|c| c == key) {
                            Some(i) => i + 1,
                            None => {
                                citations.push(key.to_string());
                                citations.len()
                            }
                        };
                        push_reference(&mut html, index, key, record);
                        cursor = open + 1 + close + 1;
                    }
                    _ => {
                        html.push('[');
                        cursor = open + 1;
                    }
                }
            }
            // a nested `[` restarts the marker from there
            Some(_) => {
                html.push('[');
                cursor = open + 1;
            }
            None => {
                if is_partial && !after.contains(char::is_whitespace) {
                    pending = Some(text[open..].to_string());
                }
                html.push_str(&text[open..]);
                cursor = text.len();
                break;
            }
        }
    }
    html.push_str(&text[cursor..]);

    ParsedAnswer { html: sanitize(&html), citations, pending }
}

fn push_reference(html: &mut String, index: usize, key: &str, record: &DocumentRecord) {
    let title = record.name().unwrap_or(key);
    let _ = write!(
        html,
        r#"<a class="citation" data-citation-index="{index}" data-citation-key="{}" title="{}"><sup>{index}</sup></a>"#,
        encode_double_quoted_attribute(key),
        encode_double_quoted_attribute(title),
    );
}

/// strips script vectors (tags, event handlers, `javascript:` urls) and lets
/// ordinary formatting plus the citation attributes through.
fn sanitize(html: &str) -> String {
    let mut builder = ammonia::Builder::default();
    builder
        .add_tag_attributes("a", &["class", "data-citation-index", "data-citation-key"])
        .link_rel(None);
    builder.clean(html).to_string()
}
