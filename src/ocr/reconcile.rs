//! Turning engine output into `(alias, value)` pairs.
//!
//! The query engine gives us a block graph with a confidence for each answer.
//! The fallback engine gives us a single blob of text. Both end up as a list
//! of [`FormDatum`] values, which [`build_field_map`] turns into one value per
//! declared query.

use std::collections::HashMap;

use super::{
    blocks::{Block, BlockGraph, BlockType},
    query::QuerySet,
    table::{FieldMap, NOT_FOUND},
};
use crate::prelude::*;

/// Separates answer text from its confidence in a field value.
const CONFIDENCE_SEPARATOR: &str = " --> ";

/// One extracted value for one query alias.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormDatum {
    pub alias: String,
    pub value: String,
}

impl FormDatum {
    /// Create a new form datum.
    pub fn new(alias: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            value: value.into(),
        }
    }
}

/// Extract answers from a query engine's block graph.
///
/// Every `QUERY` block with an alias contributes one datum per answer block
/// it points to. Queries without an alias, and edges to blocks that aren't
/// present, contribute nothing.
pub fn reconcile_primary(blocks: &[Block]) -> Vec<FormDatum> {
    let graph = BlockGraph::new(blocks);
    let mut form_data = vec![];
    for query in graph.of_type(&BlockType::Query) {
        let Some(alias) = query.alias.as_deref() else {
            debug!(id = %query.id, "Skipping QUERY block without alias");
            continue;
        };
        for id in query.related_ids() {
            let Some(answer) = graph.get(id) else {
                trace!(%alias, %id, "Answer block not found");
                continue;
            };
            form_data.push(FormDatum::new(alias, answer_value(answer)));
        }
    }
    form_data
}

/// Pair the same raw OCR text with every declared query.
///
/// Plain OCR can't tell which part of the page answers which query, so this
/// is all we can offer.
pub fn reconcile_fallback(raw_text: &str, queries: &QuerySet) -> Vec<FormDatum> {
    queries
        .aliases()
        .map(|alias| FormDatum::new(alias, raw_text))
        .collect()
}

/// Join a page's `LINE` blocks into a plain-text transcript, one line per
/// block, in engine order.
pub fn transcribe_lines(blocks: &[Block]) -> String {
    let mut transcript = String::new();
    for line in blocks.iter().filter(|b| b.block_type == BlockType::Line) {
        if let Some(text) = &line.text {
            transcript.push_str(text);
            transcript.push('\n');
        }
    }
    transcript
}

/// Build a field map with exactly one entry per declared query.
///
/// If several data share an alias, the last one wins. Aliases with no data
/// get [`NOT_FOUND`]. Data for undeclared aliases are ignored.
pub fn build_field_map(queries: &QuerySet, form_data: &[FormDatum]) -> FieldMap {
    let mut latest = HashMap::new();
    for datum in form_data {
        latest.insert(datum.alias.as_str(), datum.value.as_str());
    }
    FieldMap::from_entries(queries.aliases().map(|alias| {
        let value = latest.get(alias).copied().unwrap_or(NOT_FOUND);
        (alias.to_owned(), value.to_owned())
    }))
}

/// Render an answer block as `"<text> --> <confidence>"`.
fn answer_value(answer: &Block) -> String {
    let text = answer.text.as_deref().unwrap_or_default();
    match answer.confidence {
        Some(confidence) => {
            format!("{text}{CONFIDENCE_SEPARATOR}{}", format_confidence(confidence))
        }
        None => text.to_owned(),
    }
}

/// Format a confidence as a decimal literal: shortest round-trip digits, and
/// always at least one digit after the point.
fn format_confidence(confidence: f32) -> String {
    let formatted = confidence.to_string();
    if confidence.is_finite() && !formatted.contains('.') {
        format!("{formatted}.0")
    } else {
        formatted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{
        blocks::RelationshipType,
        query::{Query, QuerySet},
    };

    fn queries(aliases: &[&str]) -> QuerySet {
        QuerySet::new(
            aliases
                .iter()
                .map(|a| Query::new(*a, format!("What is {a}?")))
                .collect(),
        )
        .unwrap()
    }

    fn answered(query_id: &str, alias: &str, answer_id: &str) -> Block {
        Block::new(query_id, BlockType::Query)
            .with_alias(alias)
            .with_relationship(RelationshipType::Answer, [answer_id])
    }

    #[test]
    fn resolves_answer_with_confidence() {
        let blocks = vec![
            answered("q1", "A", "r1"),
            Block::new("r1", BlockType::QueryResult).with_text("Paris", 97.5),
        ];
        let form_data = reconcile_primary(&blocks);
        assert_eq!(form_data, vec![FormDatum::new("A", "Paris --> 97.5")]);

        let field_map = build_field_map(&queries(&["A"]), &form_data);
        assert_eq!(field_map.get("A"), Some("Paris --> 97.5"));
    }

    #[test]
    fn answers_may_precede_queries() {
        let blocks = vec![
            Block::new("r1", BlockType::QueryResult).with_text("42", 88.25),
            answered("q1", "total", "r1"),
        ];
        assert_eq!(
            reconcile_primary(&blocks),
            vec![FormDatum::new("total", "42 --> 88.25")]
        );
    }

    #[test]
    fn skips_query_without_alias_or_answer() {
        let blocks = vec![
            Block::new("q1", BlockType::Query)
                .with_relationship(RelationshipType::Answer, ["r1"]),
            Block::new("q2", BlockType::Query).with_alias("unanswered"),
            answered("q3", "dangling", "missing"),
            Block::new("r1", BlockType::QueryResult).with_text("orphan", 50.0),
        ];
        assert!(reconcile_primary(&blocks).is_empty());
    }

    #[test]
    fn multiple_answers_for_one_query() {
        let blocks = vec![
            Block::new("q1", BlockType::Query)
                .with_alias("name")
                .with_relationship(RelationshipType::Answer, ["r1", "r2"]),
            Block::new("r1", BlockType::QueryResult).with_text("Ada", 90.0),
            Block::new("r2", BlockType::QueryResult).with_text("Grace", 80.5),
        ];
        let form_data = reconcile_primary(&blocks);
        assert_eq!(
            form_data,
            vec![
                FormDatum::new("name", "Ada --> 90.0"),
                FormDatum::new("name", "Grace --> 80.5"),
            ]
        );
        let field_map = build_field_map(&queries(&["name"]), &form_data);
        assert_eq!(field_map.get("name"), Some("Grace --> 80.5"));
    }

    #[test]
    fn transcript_joins_lines_only() {
        let blocks = vec![
            Block::new("l1", BlockType::Line).with_text("INVOICE", 99.0),
            answered("q1", "number", "r1"),
            Block::new("r1", BlockType::QueryResult).with_text("42", 95.0),
            Block::new("l2", BlockType::Line).with_text("Number: 42", 98.0),
            Block::new("w1", BlockType::Other("WORD".to_owned())).with_text("INVOICE", 99.0),
        ];
        assert_eq!(transcribe_lines(&blocks), "INVOICE\nNumber: 42\n");
        assert_eq!(transcribe_lines(&[]), "");
    }

    #[test]
    fn answer_without_confidence_is_bare_text() {
        let mut answer = Block::new("r1", BlockType::QueryResult);
        answer.text = Some("Oslo".to_owned());
        let blocks = vec![answered("q1", "city", "r1"), answer];
        assert_eq!(
            reconcile_primary(&blocks),
            vec![FormDatum::new("city", "Oslo")]
        );
    }

    #[test]
    fn fallback_pairs_raw_text_with_every_alias() {
        let raw = "INVOICE 123\nTotal: $40";
        let form_data = reconcile_fallback(raw, &queries(&["number", "total"]));
        assert_eq!(form_data.len(), 2);
        assert!(form_data.iter().all(|d| d.value == raw));
        assert_eq!(form_data[0].alias, "number");
        assert_eq!(form_data[1].alias, "total");
    }

    #[test]
    fn field_map_has_every_alias() {
        let declared = queries(&["X", "Y", "Z"]);
        let form_data = vec![
            FormDatum::new("X", "foo"),
            FormDatum::new("undeclared", "ignored"),
            FormDatum::new("X", "bar"),
        ];
        let field_map = build_field_map(&declared, &form_data);
        assert_eq!(field_map.len(), declared.len());
        assert_eq!(field_map.get("X"), Some("bar"));
        assert_eq!(field_map.get("Y"), Some(NOT_FOUND));
        assert_eq!(field_map.get("Z"), Some(NOT_FOUND));
        assert_eq!(field_map.get("undeclared"), None);
    }

    #[test]
    fn confidence_formatting() {
        assert_eq!(format_confidence(97.5), "97.5");
        assert_eq!(format_confidence(97.0), "97.0");
        assert_eq!(format_confidence(0.0), "0.0");
        assert_eq!(format_confidence(99.94), "99.94");
    }
}
