//! Sample documents and the repository that loads them.
//!
//! A sample is a Markdown file with level-two sections:
//!
//! ```text
//! ## Prompt        what to implement (required)
//! ## Prologue      DSLX placed before the candidate code (optional)
//! ## Signature     the required fn signature(s) (required)
//! ## Tests         DSLX acceptance tests (required)
//! ## Requirements  structural requirements for the critic (optional)
//! ```
//!
//! Heading names are case-insensitive and may appear in any order. Unknown
//! sections are ignored. A `## ` line inside a fenced block is content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dslx_eval_toolchain::parse_run_flags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EvalError, Result};
use crate::extract::fenced_blocks;

/// Fence tags whose contents are taken as code in code-bearing sections.
const CODE_TAGS: [&str; 2] = ["dslx", "dslx-snippet"];

/// A structural requirement judged by the critic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    /// Bare identifier naming the requirement.
    pub id: String,
    /// What the implementation must do.
    pub text: String,
}

/// A parsed sample document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// File stem of the sample document.
    pub id: String,
    /// Problem statement shown to the model.
    pub prompt: String,
    /// DSLX placed before the candidate code.
    pub prologue: Option<String>,
    /// Signature section text.
    pub signature: String,
    /// Individual `fn` signature lines, trimmed.
    pub signatures: Vec<String>,
    /// DSLX acceptance tests.
    pub tests: String,
    /// Structural requirements, in document order.
    pub requirements: Vec<RequirementSpec>,
    /// Interpreter flags declared by `dslx_run_flags` directives.
    pub interpreter_flags: Vec<String>,
}

impl Sample {
    /// Returns the declared requirement ids in document order.
    #[must_use]
    pub fn requirement_ids(&self) -> Vec<String> {
        self.requirements.iter().map(|r| r.id.clone()).collect()
    }

    /// Returns `true` if the sample has requirements for the critic.
    #[must_use]
    pub fn has_requirements(&self) -> bool {
        !self.requirements.is_empty()
    }
}

/// Loads sample documents from a directory.
#[derive(Debug, Clone)]
pub struct SampleRepository {
    dir: PathBuf,
}

impl SampleRepository {
    /// Creates a repository rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the samples directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists sample ids (stems of `*.md` files), sorted.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Io` if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Loads the sample with the given id.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::SampleNotFound` if `<dir>/<id>.md` does not exist,
    /// or a sample error if the document is malformed.
    pub fn load(&self, id: &str) -> Result<Sample> {
        let path = self.dir.join(format!("{id}.md"));
        if !path.is_file() {
            return Err(EvalError::sample_not_found(id, &self.dir));
        }
        Self::load_path(&path)
    }

    /// Loads a sample from an explicit path. The id is the file stem.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Io` if the file cannot be read, or a sample error
    /// if the document is malformed.
    pub fn load_path(path: &Path) -> Result<Sample> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EvalError::malformed_sample(path, "file name is not valid UTF-8"))?;
        let text = std::fs::read_to_string(path)?;
        let sample = parse_document(id, &text, path)?;
        debug!(
            sample = %sample.id,
            requirements = sample.requirements.len(),
            flags = ?sample.interpreter_flags,
            "Loaded sample"
        );
        Ok(sample)
    }

    /// Parses sample text that did not come from a file.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::MalformedSample` or `EvalError::InvalidRequirementId`.
    pub fn parse(id: &str, text: &str) -> Result<Sample> {
        parse_document(id, text, Path::new(id))
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn parse_document(id: &str, text: &str, path: &Path) -> Result<Sample> {
    let sections = split_sections(text);
    let section = |name: &str| sections.get(name).map(String::as_str);

    let prompt = section("prompt")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EvalError::malformed_sample(path, "missing or empty '## Prompt' section"))?
        .to_string();

    let signature = section("signature")
        .map(code_content)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EvalError::malformed_sample(path, "missing or empty '## Signature' section")
        })?;

    let tests = section("tests")
        .map(code_content)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EvalError::malformed_sample(path, "missing or empty '## Tests' section"))?;

    let prologue = section("prologue")
        .map(code_content)
        .filter(|s| !s.is_empty());

    let signatures: Vec<String> = signature
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("fn ") || line.starts_with("pub fn "))
        .map(String::from)
        .collect();
    if signatures.is_empty() {
        return Err(EvalError::malformed_sample(
            path,
            "'## Signature' contains no 'fn' line",
        ));
    }

    let requirements = match section("requirements") {
        Some(body) => parse_requirements(body, path)?,
        None => Vec::new(),
    };

    let mut directive_source = prologue.clone().unwrap_or_default();
    directive_source.push('\n');
    directive_source.push_str(&tests);
    let interpreter_flags = parse_run_flags(&directive_source)
        .map_err(|e| EvalError::malformed_sample(path, e.to_string()))?;

    Ok(Sample {
        id: id.to_string(),
        prompt,
        prologue,
        signature,
        signatures,
        tests,
        requirements,
        interpreter_flags,
    })
}

/// Splits a document into lowercase section name -> raw body.
///
/// A repeated heading replaces the earlier section.
fn split_sections(text: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, Vec<&str>> = HashMap::new();
    let mut current: Option<String> = None;
    let mut in_fence = false;

    for line in text.lines() {
        if in_fence {
            if line.trim() == "```" {
                in_fence = false;
            }
        } else if line.trim_start().starts_with("```") {
            in_fence = true;
        } else if let Some(heading) = line.strip_prefix("## ") {
            let name = heading.trim().to_lowercase();
            sections.insert(name.clone(), Vec::new());
            current = Some(name);
            continue;
        }

        if let Some(body) = current.as_ref().and_then(|name| sections.get_mut(name)) {
            body.push(line);
        }
    }

    sections
        .into_iter()
        .map(|(name, lines)| (name, lines.join("\n")))
        .collect()
}

/// Returns the code in a code-bearing section.
///
/// Fenced blocks tagged `dslx` or `dslx-snippet` win; without any fence the
/// trimmed section text is used.
fn code_content(body: &str) -> String {
    let blocks: Vec<String> = fenced_blocks(body)
        .into_iter()
        .filter(|block| CODE_TAGS.contains(&block.tag.as_str()))
        .map(|block| block.body.trim().to_string())
        .collect();

    if blocks.is_empty() {
        body.trim().to_string()
    } else {
        blocks.join("\n\n")
    }
}

fn is_bare_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `- id: <token>` / `requirement: <text>` entries.
fn parse_requirements(body: &str, path: &Path) -> Result<Vec<RequirementSpec>> {
    let mut entries: Vec<(String, Vec<String>)> = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("```") {
            continue;
        }

        if let Some(id) = trimmed.strip_prefix("- id:") {
            let id = id.trim().trim_matches(|c| c == '"' || c == '\'');
            if !is_bare_identifier(id) {
                return Err(EvalError::invalid_requirement_id(path, id));
            }
            if entries.iter().any(|(existing, _)| existing == id) {
                return Err(EvalError::malformed_sample(
                    path,
                    format!("duplicate requirement id '{id}'"),
                ));
            }
            entries.push((id.to_string(), Vec::new()));
            continue;
        }

        let Some((_, text)) = entries.last_mut() else {
            if trimmed.starts_with("requirement:") {
                return Err(EvalError::malformed_sample(
                    path,
                    "'requirement:' appears before any '- id:' entry",
                ));
            }
            continue;
        };

        if let Some(rest) = trimmed.strip_prefix("requirement:") {
            let rest = rest.trim();
            if !rest.is_empty() && rest != ">" && rest != "|" {
                text.push(rest.to_string());
            }
        } else if line.starts_with([' ', '\t']) {
            text.push(trimmed.to_string());
        }
    }

    entries
        .into_iter()
        .map(|(id, text)| {
            if text.is_empty() {
                Err(EvalError::malformed_sample(
                    path,
                    format!("requirement '{id}' has no text"),
                ))
            } else {
                Ok(RequirementSpec {
                    id,
                    text: text.join("\n"),
                })
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ADDER: &str = r"# Adder

## Prompt

Implement a 32-bit adder.

## Signature

```dslx-snippet
fn add(a: u32, b: u32) -> u32
```

## Tests

```dslx-snippet
// dslx_run_flags: --warnings_as_errors=false
#[test]
fn test_add() { assert_eq(add(u32:1, u32:2), u32:3) }
```
";

    #[test]
    fn test_parse_minimal_sample() {
        let sample = SampleRepository::parse("adder", ADDER).unwrap();

        assert_eq!(sample.id, "adder");
        assert_eq!(sample.prompt, "Implement a 32-bit adder.");
        assert_eq!(sample.signature, "fn add(a: u32, b: u32) -> u32");
        assert_eq!(sample.signatures, ["fn add(a: u32, b: u32) -> u32"]);
        assert!(sample.tests.starts_with("// dslx_run_flags"));
        assert!(sample.prologue.is_none());
        assert!(!sample.has_requirements());
        assert_eq!(sample.interpreter_flags, ["--warnings_as_errors=false"]);
    }

    #[test]
    fn test_headings_case_insensitive_and_unordered() {
        let text = "\
## TESTS
#[test]
fn t() {}

## signature
pub fn f() -> u32

## Notes
ignored

## prompt
Do it.
";
        let sample = SampleRepository::parse("s", text).unwrap();
        assert_eq!(sample.prompt, "Do it.");
        assert_eq!(sample.signatures, ["pub fn f() -> u32"]);
        assert_eq!(sample.tests, "#[test]\nfn t() {}");
    }

    #[test]
    fn test_heading_inside_fence_is_content() {
        let text = "\
## Prompt
Write f.

## Prologue
```dslx
## not a heading
const X = u32:1;
```

## Signature
fn f() -> u32

## Tests
fn t() {}
";
        let sample = SampleRepository::parse("s", text).unwrap();
        assert_eq!(
            sample.prologue.as_deref(),
            Some("## not a heading\nconst X = u32:1;")
        );
    }

    #[test]
    fn test_missing_sections() {
        for (missing, text) in [
            ("Prompt", "## Signature\nfn f()\n## Tests\nfn t() {}\n"),
            ("Signature", "## Prompt\nx\n## Tests\nfn t() {}\n"),
            ("Tests", "## Prompt\nx\n## Signature\nfn f()\n## Tests\n\n"),
        ] {
            let err = SampleRepository::parse("s", text).unwrap_err();
            assert!(
                matches!(&err, EvalError::MalformedSample { message, .. } if message.contains(missing)),
                "Expected MalformedSample about {missing}, got: {err:?}"
            );
        }
    }

    #[test]
    fn test_signature_without_fn_line() {
        let text = "## Prompt\nx\n## Signature\nstruct S {}\n## Tests\nfn t() {}\n";
        let err = SampleRepository::parse("s", text).unwrap_err();
        assert!(err.to_string().contains("no 'fn' line"));
    }

    #[test]
    fn test_requirements_parsing() {
        let text = format!(
            "{ADDER}\n## Requirements\n\n- id: no_loops\n  requirement: Must not use a for loop.\n- id: uses_carry_chain\n  requirement: >\n    Must build an explicit\n    carry chain.\n"
        );
        let sample = SampleRepository::parse("adder", &text).unwrap();

        assert_eq!(sample.requirement_ids(), ["no_loops", "uses_carry_chain"]);
        assert_eq!(sample.requirements[0].text, "Must not use a for loop.");
        assert_eq!(
            sample.requirements[1].text,
            "Must build an explicit\ncarry chain."
        );
    }

    #[test]
    fn test_requirement_errors() {
        let bad_id = format!("{ADDER}\n## Requirements\n- id: no-loops\n  requirement: x\n");
        assert!(matches!(
            SampleRepository::parse("s", &bad_id).unwrap_err(),
            EvalError::InvalidRequirementId { id, .. } if id == "no-loops"
        ));

        let dup = format!(
            "{ADDER}\n## Requirements\n- id: a\n  requirement: x\n- id: a\n  requirement: y\n"
        );
        assert!(SampleRepository::parse("s", &dup)
            .unwrap_err()
            .to_string()
            .contains("duplicate requirement id 'a'"));

        let empty = format!("{ADDER}\n## Requirements\n- id: a\n");
        assert!(SampleRepository::parse("s", &empty)
            .unwrap_err()
            .to_string()
            .contains("has no text"));
    }

    #[test]
    fn test_bad_run_flags_directive() {
        let text = ADDER.replace("--warnings_as_errors=false", "warnings");
        let err = SampleRepository::parse("adder", &text).unwrap_err();
        assert!(err.is_sample_error());
    }

    #[test]
    fn test_repository_list_load_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_adder.md"), ADDER).unwrap();
        std::fs::write(dir.path().join("a_adder.md"), ADDER).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a sample").unwrap();

        let repo = SampleRepository::new(dir.path());
        assert_eq!(repo.list().unwrap(), ["a_adder", "b_adder"]);

        let first = repo.load("a_adder").unwrap();
        let second = repo.load("a_adder").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, "a_adder");
    }

    #[test]
    fn test_repository_missing_sample() {
        let dir = tempfile::tempdir().unwrap();
        let err = SampleRepository::new(dir.path()).load("nope").unwrap_err();
        assert!(matches!(err, EvalError::SampleNotFound { id, .. } if id == "nope"));
    }
}
