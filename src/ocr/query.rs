//! Natural-language queries, and the validated set sent with each page.

use std::{collections::HashSet, fmt, str::FromStr};

use schemars::JsonSchema;

use super::table::FILENAME_COLUMN;
use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// A single question to ask about each document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Query {
    /// The question, in plain language. For example, "What is the invoice
    /// number?"
    pub text: String,

    /// A short, unique name for the answer. Used as the output column name.
    pub alias: String,
}

impl Query {
    /// Create a new query.
    pub fn new(alias: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            alias: alias.into(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.alias, self.text)
    }
}

/// Parse `ALIAS=TEXT`, as used on the command line.
impl FromStr for Query {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (alias, text) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected ALIAS=TEXT, found {:?}", s))?;
        let (alias, text) = (alias.trim(), text.trim());
        if alias.is_empty() || text.is_empty() {
            return Err(anyhow!("expected ALIAS=TEXT, found {:?}", s));
        }
        Ok(Self::new(alias, text))
    }
}

/// The on-disk query file format.
///
/// ```toml
/// [[queries]]
/// alias = "invoice_number"
/// text = "What is the invoice number?"
/// ```
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryFile {
    /// The queries to run against every document, in output column order.
    pub queries: Vec<Query>,
}

impl QueryFile {
    /// Load a query file from TOML or JSON.
    pub async fn read(path: &Path) -> Result<Self> {
        read_json_or_toml(path).await
    }
}

/// A validated, ordered set of queries. Aliases are unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuerySet {
    queries: Vec<Query>,
}

impl QuerySet {
    /// Validate a list of queries.
    pub fn new(queries: Vec<Query>) -> Result<Self> {
        if queries.is_empty() {
            return Err(anyhow!("at least one query is required"));
        }
        let mut seen = HashSet::new();
        for query in &queries {
            if query.alias.trim().is_empty() {
                return Err(anyhow!("query {:?} has an empty alias", query.text));
            }
            if query.text.trim().is_empty() {
                return Err(anyhow!("query {:?} has empty text", query.alias));
            }
            // The filename gets its own column, so an alias can't reuse it.
            if query.alias == FILENAME_COLUMN {
                return Err(anyhow!(
                    "query alias {:?} is reserved for the file name column",
                    query.alias
                ));
            }
            if !seen.insert(query.alias.as_str()) {
                return Err(anyhow!("duplicate query alias {:?}", query.alias));
            }
        }
        Ok(Self { queries })
    }

    /// The queries, in declaration order.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// The aliases, in declaration order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(|q| q.alias.as_str())
    }

    /// How many queries do we have?
    pub fn len(&self) -> usize {
        self.queries.len()
    }
}
