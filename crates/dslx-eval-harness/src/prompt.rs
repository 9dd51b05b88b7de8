//! Conversations and prompt assembly.
//!
//! A [`Conversation`] is the append-only transcript sent to a model. It
//! always opens with one preamble turn and one problem turn; each model reply
//! adds a candidate turn and each retry adds a feedback turn.

use std::collections::HashSet;

use dslx_eval_toolchain::ToolchainResult;
use serde::{Deserialize, Serialize};

use crate::sample::Sample;

/// Marker appended to feedback that was cut short.
pub const TRUNCATION_MARKER: &str = "... [output truncated]";

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions from the harness.
    System,
    /// Problem statements and feedback.
    User,
    /// Model replies.
    Assistant,
}

/// What a turn carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    /// Tutorial or critic instructions.
    Preamble,
    /// The task statement.
    Problem,
    /// A model reply.
    Candidate,
    /// Diagnostics from a failed attempt.
    Feedback,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced the turn.
    pub role: Role,
    /// What the turn carries.
    pub kind: TurnKind,
    /// Message text.
    pub text: String,
}

/// Append-only transcript of one model exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Starts a conversation with a system preamble and a user problem turn.
    #[must_use]
    pub fn new(preamble: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            turns: vec![
                Turn {
                    role: Role::System,
                    kind: TurnKind::Preamble,
                    text: preamble.into(),
                },
                Turn {
                    role: Role::User,
                    kind: TurnKind::Problem,
                    text: problem.into(),
                },
            ],
        }
    }

    /// Appends a model reply.
    pub fn push_candidate(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            kind: TurnKind::Candidate,
            text: text.into(),
        });
    }

    /// Appends diagnostics for the model.
    pub fn push_feedback(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::User,
            kind: TurnKind::Feedback,
            text: text.into(),
        });
    }

    /// Returns all turns in order.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Returns the number of turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Always `false`; a conversation starts with two turns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Counts turns of the given kind.
    #[must_use]
    pub fn count(&self, kind: TurnKind) -> usize {
        self.turns.iter().filter(|t| t.kind == kind).count()
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Builds the opening conversation for a sample.
#[must_use]
pub fn assemble(preamble: &str, sample: &Sample) -> Conversation {
    Conversation::new(preamble, problem_text(sample))
}

/// Builds the problem turn text for a sample.
#[must_use]
pub fn problem_text(sample: &Sample) -> String {
    let mut text = String::new();
    text.push_str(sample.prompt.trim());
    text.push_str("\n\nSignature:\n```dslx\n");
    text.push_str(sample.signature.trim());
    text.push_str("\n```\n");

    if let Some(prologue) = &sample.prologue {
        text.push_str("\nPrologue (already part of the module, shown for reference):\n```dslx\n");
        text.push_str(prologue.trim());
        text.push_str("\n```\n");
    }

    text.push_str(
        "\nImplement the signature above. The prologue and the acceptance tests are \
         supplied separately when your code is run: do not restate the prologue and \
         do not write tests.\n",
    );
    text
}

/// Builds the feedback turn for a failed toolchain run.
///
/// Uses stderr then stdout of the failing stage with blank and repeated lines
/// dropped, cut to at most `max_chars` characters.
#[must_use]
pub fn toolchain_feedback(result: &ToolchainResult, max_chars: usize) -> String {
    let diagnostics = result
        .failing_stage()
        .map(|stage| condense(&[&stage.stderr, &stage.stdout]))
        .unwrap_or_default();
    let diagnostics = truncate_chars(&diagnostics, max_chars);
    format!("Error encountered:\n```\n{diagnostics}\n```\n")
}

/// Builds the feedback turn for a reply without a code block.
#[must_use]
pub fn no_code_feedback(tags: &[String]) -> String {
    let tag = tags.first().map_or("dslx", String::as_str);
    format!(
        "Error encountered:\nNo fenced code block tagged `{tag}` was found in your reply. \
         Reply with exactly one ```{tag} block containing the complete implementation.\n"
    )
}

/// Joins the non-blank lines of `parts`, dropping repeats and keeping order.
fn condense(parts: &[&str]) -> String {
    let mut seen = HashSet::new();
    parts
        .iter()
        .flat_map(|part| part.lines())
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| seen.insert(*line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cuts `text` to `max_chars` characters, appending a marker when cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}\n{TRUNCATION_MARKER}", &text[..byte_index]),
        None => text.to_string(),
    }
}
