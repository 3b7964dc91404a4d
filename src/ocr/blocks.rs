//! Engine-neutral blocks returned by a structured query engine.
//!
//! A page analysis is a graph: `QUERY` blocks point at `QUERY_RESULT` blocks
//! through relationship edges, and answers are found by following those edges.
//! We store blocks in an arena and index them by ID once per page, so each edge
//! is a single hash lookup.

use std::collections::HashMap;

/// The kind of a [`Block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockType {
    /// A question we asked. Carries the query alias.
    Query,
    /// An answer to a query.
    QueryResult,
    /// A line of text, in reading order. Used for transcripts.
    Line,
    /// Anything else the engine returns, which we ignore.
    Other(String),
}

/// The kind of a [`Relationship`] edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationshipType {
    /// Points from a query to its answers.
    Answer,
    /// Points from a container to its contents.
    Child,
    /// Anything else.
    Other(String),
}

/// An edge from one block to a list of other blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct Relationship {
    pub kind: RelationshipType,
    pub ids: Vec<String>,
}

/// A single block of engine output.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: String,
    pub block_type: BlockType,
    /// The query alias. Only present on [`BlockType::Query`] blocks.
    pub alias: Option<String>,
    pub text: Option<String>,
    /// Confidence, from 0 to 100.
    pub confidence: Option<f32>,
    pub relationships: Vec<Relationship>,
}

impl Block {
    /// Create a block with no optional fields set.
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            alias: None,
            text: None,
            confidence: None,
            relationships: vec![],
        }
    }

    /// All IDs this block points to, across all relationship edges.
    pub fn related_ids(&self) -> impl Iterator<Item = &str> {
        self.relationships
            .iter()
            .flat_map(|r| r.ids.iter().map(String::as_str))
    }
}

#[cfg(test)]
impl Block {
    /// Set the query alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the text and confidence.
    pub fn with_text(mut self, text: impl Into<String>, confidence: f32) -> Self {
        self.text = Some(text.into());
        self.confidence = Some(confidence);
        self
    }

    /// Add a relationship edge.
    pub fn with_relationship(
        mut self,
        kind: RelationshipType,
        ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.relationships.push(Relationship {
            kind,
            ids: ids.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// The blocks for one page, indexed by ID.
#[derive(Debug)]
pub struct BlockGraph<'a> {
    blocks: &'a [Block],
    by_id: HashMap<&'a str, usize>,
}

impl<'a> BlockGraph<'a> {
    /// Index a page's blocks. If an ID appears more than once, the first block
    /// wins.
    pub fn new(blocks: &'a [Block]) -> Self {
        let mut by_id = HashMap::with_capacity(blocks.len());
        for (idx, block) in blocks.iter().enumerate() {
            by_id.entry(block.id.as_str()).or_insert(idx);
        }
        Self { blocks, by_id }
    }

    /// Look up a block by ID.
    pub fn get(&self, id: &str) -> Option<&'a Block> {
        self.by_id.get(id).map(|&idx| &self.blocks[idx])
    }

    /// All blocks of a given type, in engine order.
    pub fn of_type<'g>(
        &'g self,
        block_type: &'g BlockType,
    ) -> impl Iterator<Item = &'a Block> + 'g {
        self.blocks.iter().filter(move |b| &b.block_type == block_type)
    }
}
