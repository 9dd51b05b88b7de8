//! Tutorial loading for the generation preamble.
//!
//! The tutorial is a Markdown document describing the DSLX language. It is
//! sent verbatim at the start of every generation conversation, followed by a
//! fixed instruction describing the expected answer format.

use std::path::{Path, PathBuf};

use crate::error::{EvalError, Result};

/// Maximum allowed tutorial file size in bytes (100KB).
pub const MAX_TUTORIAL_SIZE: u64 = 100 * 1024;

/// Answer-format instruction appended to the tutorial.
pub const ANSWER_FORMAT_INSTRUCTION: &str = "\
**Important:** reply with **exactly one** fenced code block tagged `dslx` \
containing the DSLX code that solves the problem. It will be extracted and \
run **directly** by a DSLX interpreter together with a hidden acceptance test \
suite. Do **not** apologize or explain. Do **not** write any tests, as they may \
interfere with the acceptance tests. Any errors that occur while running the \
tests will be sent back to you.";

/// Leading tutorial lines included in the critic reference.
const CRITIC_REFERENCE_INTRO_LINES: usize = 80;

/// Tutorial sections, as (start, end) markers, that describe how values flow
/// through a DSLX function.
const CRITIC_REFERENCE_SECTIONS: [(&str, &str); 2] = [
    (
        "**Immutable Array Updates**",
        "**No Mutation, Even In Control Flow Blocks**",
    ),
    ("**For Loops**", "**No While Loops**"),
];

/// In-memory representation of a loaded tutorial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tutorial {
    /// Path to the tutorial file.
    pub path: PathBuf,

    /// Raw Markdown content of the tutorial.
    pub content: String,

    /// Size of the tutorial file in bytes.
    pub size_bytes: usize,
}

impl Tutorial {
    /// Loads a tutorial from the given file path.
    ///
    /// Validates that:
    /// - The file exists
    /// - The file size is within the 100KB limit
    /// - The content is valid UTF-8
    ///
    /// # Errors
    ///
    /// Returns `EvalError::TutorialNotFound` if the file doesn't exist.
    /// Returns `EvalError::TutorialTooLarge` if the file exceeds 100KB.
    /// Returns `EvalError::TutorialEncodingError` if the file is not valid UTF-8.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EvalError::tutorial_not_found(path)
            } else {
                EvalError::Io(e)
            }
        })?;

        let file_size = metadata.len();
        if file_size > MAX_TUTORIAL_SIZE {
            return Err(EvalError::tutorial_too_large(path, file_size / 1024));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                EvalError::tutorial_encoding(path)
            } else {
                EvalError::Io(e)
            }
        })?;

        let canonical_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            path: canonical_path,
            size_bytes: content.len(),
            content,
        })
    }

    /// Creates a tutorial from in-memory text.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: PathBuf::from("<inline>"),
            size_bytes: content.len(),
            content,
        }
    }

    /// Returns the preamble sent at the start of every generation conversation.
    #[must_use]
    pub fn preamble(&self) -> String {
        format!(
            "{}\n\n{}\n",
            self.content.trim_end(),
            ANSWER_FORMAT_INSTRUCTION
        )
    }

    /// Returns a bounded language reference for the critic.
    ///
    /// This is the head of the tutorial plus the array-update and `for` loop
    /// sections, when present and not already part of the head.
    #[must_use]
    pub fn critic_reference(&self) -> String {
        let intro = self
            .content
            .lines()
            .take(CRITIC_REFERENCE_INTRO_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        let intro = intro.trim();

        let mut parts = vec!["DSLX language reference (excerpt):", intro];
        for (start, end) in CRITIC_REFERENCE_SECTIONS {
            if let Some(section) = section_between(&self.content, start, end) {
                if !intro.contains(section) {
                    parts.push(section);
                }
            }
        }
        parts.join("\n\n").trim().to_string()
    }
}

/// Text from `start` up to, not including, the next `end`.
fn section_between<'a>(content: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = content.find(start)?;
    let to = from + content[from..].find(end)?;
    Some(content[from..to].trim())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tutorial_size_constant() {
        assert_eq!(MAX_TUTORIAL_SIZE, 102_400);
    }

    #[test]
    fn test_load_valid_tutorial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        let content = "# DSLX\n\nFunctions are declared with `fn`.";
        std::fs::write(&path, content).unwrap();

        let tutorial = Tutorial::load(&path).unwrap();
        assert!(tutorial.path.ends_with("prompt.md"));
        assert_eq!(tutorial.content, content);
        assert_eq!(tutorial.size_bytes, content.len());
    }

    #[test]
    fn test_load_nonexistent_tutorial() {
        let err = Tutorial::load("/nonexistent/path/prompt.md").unwrap_err();
        assert!(
            matches!(&err, EvalError::TutorialNotFound { path } if path.ends_with("prompt.md")),
            "Expected TutorialNotFound, got: {err:?}"
        );
    }

    #[test]
    fn test_load_tutorial_size_limit() {
        let dir = tempfile::tempdir().unwrap();

        let at_limit = dir.path().join("at_limit.md");
        std::fs::write(&at_limit, "x".repeat(100 * 1024)).unwrap();
        assert_eq!(Tutorial::load(&at_limit).unwrap().size_bytes, 100 * 1024);

        let over = dir.path().join("over.md");
        std::fs::write(&over, "x".repeat(150 * 1024)).unwrap();
        let err = Tutorial::load(&over).unwrap_err();
        assert!(
            matches!(&err, EvalError::TutorialTooLarge { size_kb, .. } if *size_kb == 150),
            "Expected TutorialTooLarge, got: {err:?}"
        );
    }

    #[test]
    fn test_load_tutorial_invalid_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.md");
        std::fs::write(&path, [0x80, 0x81, 0x82, 0xFF, 0xFE]).unwrap();

        let err = Tutorial::load(&path).unwrap_err();
        assert!(matches!(err, EvalError::TutorialEncodingError { .. }));
    }

    #[test]
    fn test_preamble_appends_answer_format() {
        let tutorial = Tutorial::from_text("# DSLX reference\n\n");
        let preamble = tutorial.preamble();

        assert!(preamble.starts_with("# DSLX reference\n\n**Important:**"));
        assert!(preamble.contains("fenced code block tagged `dslx`"));
        assert!(preamble.contains("Do **not** write any tests"));
        assert!(preamble.ends_with('\n'));
    }

    #[test]
    fn test_critic_reference_short_tutorial() {
        let tutorial = Tutorial::from_text("# DSLX\n\n**For Loops**\nfor is an expression.\n");

        let reference = tutorial.critic_reference();

        assert!(reference.starts_with("DSLX language reference (excerpt):\n\n# DSLX"));
        assert_eq!(reference.matches("**For Loops**").count(), 1);
        assert!(!reference.contains(ANSWER_FORMAT_INSTRUCTION));
    }

    #[test]
    fn test_critic_reference_pulls_sections_past_head() {
        let filler = "filler line\n".repeat(100);
        let content = format!(
            "# Head\n{filler}**Immutable Array Updates**\nuse update(a, i, v).\n\
             **No Mutation, Even In Control Flow Blocks**\nnever shown\n\
             **For Loops**\nfor (i, acc) in range(...)\n\
             **No While Loops**\nnever shown either\n"
        );
        let tutorial = Tutorial::from_text(content);

        let reference = tutorial.critic_reference();

        assert!(reference.contains("# Head"));
        assert!(reference.contains("**Immutable Array Updates**\nuse update(a, i, v)."));
        assert!(reference.contains("**For Loops**\nfor (i, acc) in range(...)"));
        assert!(!reference.contains("never shown"));
        assert_eq!(reference.matches("filler line").count(), 79);
    }

    #[test]
    fn test_critic_reference_skips_unterminated_section() {
        let filler = "x\n".repeat(100);
        let tutorial = Tutorial::from_text(format!("# Head\n{filler}**For Loops**\nno end marker\n"));

        assert!(!tutorial.critic_reference().contains("no end marker"));
    }
}
