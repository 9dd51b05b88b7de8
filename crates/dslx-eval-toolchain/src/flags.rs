//! Interpreter flag directives embedded in DSLX sources.
//!
//! A sample may ask for extra interpreter flags with a comment line such as
//!
//! ```text
//! // dslx_run_flags: --warnings_as_errors=false --max_ticks=100
//! ```
//!
//! `dslx_run_options:` is accepted as an alias.

use std::sync::OnceLock;

use regex::Regex;

use crate::ToolchainError;

#[allow(clippy::expect_used)]
fn directive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*//\s*dslx_run_(?:flags|options):\s*(.*?)\s*$")
            .expect("directive pattern is a valid regex")
    })
}

/// Collects the flags declared by every directive line in `source`.
///
/// Tokens are split with shell quoting rules. Every token must start with
/// `--`. Duplicates are dropped, keeping the first occurrence.
///
/// # Errors
///
/// Returns [`ToolchainError::InvalidDirective`] on unbalanced quotes or a
/// token that is not a long flag.
pub fn parse_run_flags(source: &str) -> Result<Vec<String>, ToolchainError> {
    let mut flags = Vec::new();

    for line in source.lines() {
        let Some(captures) = directive_pattern().captures(line) else {
            continue;
        };
        let body = captures.get(1).map_or("", |m| m.as_str());
        let tokens = shell_words::split(body)
            .map_err(|e| ToolchainError::invalid_directive(line.trim(), e.to_string()))?;

        for token in tokens {
            if !token.starts_with("--") {
                return Err(ToolchainError::invalid_directive(
                    line.trim(),
                    format!("'{token}' is not a --flag"),
                ));
            }
            if !flags.contains(&token) {
                flags.push(token);
            }
        }
    }

    Ok(flags)
}

/// Appends `extra` to `base`, skipping flags already present.
#[must_use]
pub fn merge_flags(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged = base.to_vec();
    for flag in extra {
        if !merged.contains(flag) {
            merged.push(flag.clone());
        }
    }
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_no_directives() {
        let source = "fn f() -> u32 { u32:1 }\n// just a comment\n";
        assert!(parse_run_flags(source).unwrap().is_empty());
    }

    #[test]
    fn test_directive_pattern_matches_directive_lines() {
        let pattern = directive_pattern();
        assert!(pattern.is_match("  //   dslx_run_flags: --max_ticks=5"));
        assert!(pattern.is_match("// dslx_run_options:"));
        assert!(!pattern.is_match("let x = u32:1; // dslx_run_flags: --a"));
    }

    #[test]
    fn test_flags_and_options_aliases() {
        let source = "\
// dslx_run_flags: --warnings_as_errors=false
#[test]
fn t() {}
  //   dslx_run_options:   --max_ticks=10
";
        assert_eq!(
            parse_run_flags(source).unwrap(),
            ["--warnings_as_errors=false", "--max_ticks=10"]
        );
    }

    #[test]
    fn test_quoted_values_and_dedup() {
        let source = "\
// dslx_run_flags: --format='a b' --max_ticks=10
// dslx_run_flags: --max_ticks=10
";
        assert_eq!(
            parse_run_flags(source).unwrap(),
            ["--format=a b", "--max_ticks=10"]
        );
    }

    #[test]
    fn test_rejects_non_flag_token() {
        let err = parse_run_flags("// dslx_run_flags: -v").unwrap_err();
        assert!(matches!(err, ToolchainError::InvalidDirective { .. }));
        assert!(err.to_string().contains("'-v'"));
    }

    #[test]
    fn test_rejects_unbalanced_quote() {
        let err = parse_run_flags("// dslx_run_flags: --x='open").unwrap_err();
        assert!(matches!(err, ToolchainError::InvalidDirective { .. }));
    }

    #[test]
    fn test_empty_directive_is_allowed() {
        assert!(parse_run_flags("// dslx_run_flags:").unwrap().is_empty());
    }

    #[test]
    fn test_merge_flags_keeps_order() {
        let base = vec!["--compare=jit".to_string()];
        let extra = vec!["--max_ticks=5".to_string(), "--compare=jit".to_string()];
        assert_eq!(merge_flags(&base, &extra), ["--compare=jit", "--max_ticks=5"]);
    }
}
