//! Shared small types used across modules: the `Parser` external-collaborator
//! contract (spec.md §1, §4.2) and a couple of simple aliases.

use std::sync::Arc;

/// One named section of a parsed terminal response (e.g. Claude's "assistant" section).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Section {
    pub name: String,
    pub content: String,
}

/// Result of parsing a terminal buffer slice.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ParsedResponse {
    pub is_ready: bool,
    pub sections: Vec<Section>,
    pub raw: String,
}

impl ParsedResponse {
    /// Canonical textual output: the last section's content, or `raw` if there are none.
    pub fn output_text(&self) -> String {
        self.sections
            .last()
            .map(|s| s.content.clone())
            .unwrap_or_else(|| self.raw.clone())
    }
}

/// External collaborator (spec.md §1): turns a raw terminal buffer into structured
/// sections and a readiness signal. The core only depends on this contract; concrete
/// parsers (e.g. a "Claude" parser that recognizes vim-style INSERT-mode prompts) are
/// out of scope and supplied by the embedder.
pub trait Parser: Send + Sync {
    /// True when the buffer looks like a completed response (no more output pending).
    fn is_ready(&self, buffer: &str) -> bool;

    /// Parses the new-since-send slice of the buffer into structured sections.
    fn parse(&self, buffer: &str) -> ParsedResponse;

    /// Display name, used to pick a default per terminal node variant ("claude", "plain").
    fn name(&self) -> &str;
}

pub type ParserRef = Arc<dyn Parser>;

/// A trivial parser that is always ready and returns the whole buffer as one
/// "raw" section. Used as the default for plain (non-Claude) terminal nodes
/// and in tests; a real Claude-aware parser is supplied by the embedder.
pub struct PlainParser;

impl Parser for PlainParser {
    fn is_ready(&self, _buffer: &str) -> bool {
        true
    }

    fn parse(&self, buffer: &str) -> ParsedResponse {
        ParsedResponse {
            is_ready: true,
            sections: vec![Section {
                name: "raw".to_string(),
                content: buffer.to_string(),
            }],
            raw: buffer.to_string(),
        }
    }

    fn name(&self) -> &str {
        "plain"
    }
}
