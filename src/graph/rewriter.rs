//! Similarity-extension fallback rewriting.
//!
//! When the graph store does not have its similarity extension installed,
//! queries that call [`SIMILARITY_FUNCTION`] must be rewritten before they are
//! submitted. The rewrite is a pipeline with explicit outcomes:
//!
//! 1. exact match in the known-query map → the registered fallback text
//! 2. otherwise replace every `similarity(a, b)` call with its algebraic
//!    expansion `dot(a, b) / (norm(a) * norm(b))` written with `reduce`
//! 3. otherwise (arguments not well formed) leave the query untouched and let
//!    the store report its own error
//!
//! The module also classifies queries as reads or writes by keyword.

use std::borrow::Cow;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::AccessMode;

/// Name of the extension's cosine similarity function.
pub const SIMILARITY_FUNCTION: &str = "gds.similarity.cosine";

/// `gds.similarity.cosine(<arg>, <arg>)` where each argument is a parameter or
/// a (dotted) property reference.
static SIMILARITY_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"gds\.similarity\.cosine\(\s*(\$?[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*,\s*(\$?[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\)",
    )
    .expect("similarity call pattern is valid")
});

static WRITE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(CREATE|MERGE|SET|DELETE|REMOVE|DROP)\b").expect("write keyword pattern is valid")
});

/// Outcome of running a query through the rewrite pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite<'q> {
    /// The query does not call the similarity function.
    Unchanged,
    /// Exact match in the known-query map.
    Known(&'q str),
    /// Every call was expanded by the generic rewrite.
    Generic(String),
    /// The query calls the function but not every call has two well-formed
    /// arguments; the original text is used.
    Malformed,
}

impl<'q> Rewrite<'q> {
    /// The text to submit, given the original query.
    pub fn into_text(self, original: &'q str) -> Cow<'q, str> {
        match self {
            Rewrite::Unchanged | Rewrite::Malformed => Cow::Borrowed(original),
            Rewrite::Known(text) => Cow::Borrowed(text),
            Rewrite::Generic(text) => Cow::Owned(text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRewriter {
    known: HashMap<String, String>,
}

impl QueryRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewriter pre-loaded with the crate's own statement fallbacks.
    pub fn with_builtin_fallbacks() -> Self {
        let mut rewriter = Self::new();
        for (original, fallback) in super::queries::known_fallbacks() {
            rewriter.register(original, fallback);
        }
        rewriter
    }

    /// Register a fallback for an exact query text.
    pub fn register(&mut self, original: impl Into<String>, fallback: impl Into<String>) {
        self.known.insert(original.into(), fallback.into());
    }

    pub fn invokes_similarity(query: &str) -> bool {
        query.contains(SIMILARITY_FUNCTION)
    }

    /// Stage 1: known-template lookup.
    pub fn rewrite_known<'q>(&'q self, query: &str) -> Option<&'q str> {
        self.known.get(query).map(String::as_str)
    }

    /// Run the full pipeline.
    pub fn rewrite<'q>(&'q self, query: &str) -> Rewrite<'q> {
        if !Self::invokes_similarity(query) {
            return Rewrite::Unchanged;
        }
        if let Some(fallback) = self.rewrite_known(query) {
            return Rewrite::Known(fallback);
        }
        match rewrite_generic(query) {
            Some(text) => Rewrite::Generic(text),
            None => {
                log::warn!("Could not rewrite similarity call; submitting query unchanged");
                Rewrite::Malformed
            }
        }
    }
}

/// Stage 2: expand every similarity call. `None` when any call is malformed.
pub fn rewrite_generic(query: &str) -> Option<String> {
    let calls = query.matches(SIMILARITY_FUNCTION).count();
    let well_formed = SIMILARITY_CALL.find_iter(query).count();
    if calls == 0 || well_formed != calls {
        return None;
    }
    let rewritten = SIMILARITY_CALL.replace_all(query, |caps: &Captures| {
        manual_cosine_expression(&caps[1], &caps[2])
    });
    Some(rewritten.into_owned())
}

/// `dot(a, b) / (sqrt(sum a²) * sqrt(sum b²))` in Cypher.
pub fn manual_cosine_expression(a: &str, b: &str) -> String {
    format!(
        "(reduce(dot = 0.0, i IN range(0, size({a}) - 1) | dot + {a}[i] * {b}[i]) / \
         (sqrt(reduce(sa = 0.0, i IN range(0, size({a}) - 1) | sa + {a}[i] * {a}[i])) * \
         sqrt(reduce(sb = 0.0, i IN range(0, size({b}) - 1) | sb + {b}[i] * {b}[i]))))",
        a = a,
        b = b
    )
}

/// Access mode a query needs. Any mutating keyword forces `Write`, whatever
/// the caller hinted.
pub fn classify_access(query: &str, read_only_hint: bool) -> AccessMode {
    if WRITE_KEYWORD.is_match(query) {
        AccessMode::Write
    } else if read_only_hint {
        AccessMode::Read
    } else {
        AccessMode::Write
    }
}
