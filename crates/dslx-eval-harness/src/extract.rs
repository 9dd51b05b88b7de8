//! Candidate code extraction and module assembly.
//!
//! A model reply is free text. Only fenced blocks whose info string starts
//! with one of the configured language tags count as code. An opening fence
//! without a matching closing fence is not a block.

use dslx_eval_toolchain::ModuleSource;
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};

/// Marker line separating candidate code from the acceptance tests.
pub const TESTS_MARKER: &str = "// -- tests";

/// A fenced block found in Markdown text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// First word of the info string, empty for a bare fence.
    pub tag: String,
    /// Lines between the fences.
    pub body: String,
}

/// Scans `text` for closed triple-backtick fenced blocks.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let Some((_, body)) = open.as_mut() else {
            if let Some(info) = line.trim_start().strip_prefix("```") {
                let tag = info.split_whitespace().next().unwrap_or("").to_string();
                open = Some((tag, Vec::new()));
            }
            continue;
        };

        if line.trim() != "```" {
            body.push(line);
            continue;
        }

        if let Some((tag, body)) = open.take() {
            blocks.push(FencedBlock {
                tag,
                body: body.join("\n"),
            });
        }
    }

    blocks
}

/// Candidate code pulled out of a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFragment(String);

impl SourceFragment {
    /// Wraps fragment text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the fragment text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Pulls tagged code blocks out of model replies.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    tags: Vec<String>,
}

impl Default for CodeExtractor {
    fn default() -> Self {
        Self::new(vec!["dslx".to_string()])
    }
}

impl CodeExtractor {
    /// Creates an extractor accepting the given language tags.
    #[must_use]
    pub fn new(tags: Vec<String>) -> Self {
        Self {
            tags: tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Returns the accepted language tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Concatenates every accepted block in `candidate`, blank-line separated.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::NoCodeBlock` if no accepted block is present.
    pub fn extract(&self, candidate: &str) -> Result<SourceFragment> {
        let bodies: Vec<String> = fenced_blocks(candidate)
            .into_iter()
            .filter(|block| self.tags.iter().any(|t| t.eq_ignore_ascii_case(&block.tag)))
            .map(|block| block.body.trim_matches('\n').to_string())
            .collect();

        if bodies.is_empty() {
            return Err(EvalError::NoCodeBlock {
                tags: self.tags.clone(),
            });
        }

        Ok(SourceFragment(bodies.join("\n\n")))
    }
}

/// Builds the complete module: prologue, fragment, tests marker, tests.
///
/// Inputs are placed in that order and otherwise left untouched.
#[must_use]
pub fn assemble_module(
    prologue: Option<&str>,
    fragment: &SourceFragment,
    tests: &str,
) -> ModuleSource {
    let mut text = String::new();
    if let Some(prologue) = prologue.filter(|p| !p.trim().is_empty()) {
        text.push_str(prologue.trim_end());
        text.push_str("\n\n");
    }
    text.push_str(fragment.as_str().trim_end());
    text.push_str("\n\n");
    text.push_str(TESTS_MARKER);
    text.push_str("\n\n");
    text.push_str(tests.trim_end());
    text.push('\n');
    ModuleSource::new(text)
}
