//! Markdown report generation.
//!
//! Renders a [`Report`] as a human-readable scorecard: run summary, per-model
//! pass rates, per-sample outcomes, requirement aggregates, critic
//! rationales and model usage.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::{FinalOutcome, Report, ScorecardEntry};

/// Maximum length for a rationale or detail shown in a table cell.
const MAX_CELL_LENGTH: usize = 160;

/// Generates Markdown reports from evaluation results.
///
/// The output is deterministic for a given report, except for the footer
/// timestamp.
pub struct MarkdownGenerator<'a> {
    report: &'a Report,
}

impl<'a> MarkdownGenerator<'a> {
    /// Creates a new Markdown generator for the given report.
    #[must_use]
    pub const fn new(report: &'a Report) -> Self {
        Self { report }
    }

    /// Generates the complete Markdown report.
    #[must_use]
    pub fn generate(&self) -> String {
        let mut output = String::new();

        self.write_body(&mut output);
        Self::write_footer(&mut output);

        output
    }

    /// Writes every section except the footer.
    fn write_body(&self, output: &mut String) {
        Self::write_title(output);
        self.write_summary(output);
        self.write_models(output);
        self.write_samples(output);
        self.write_requirements(output);
        self.write_verdicts(output);
    }

    fn write_title(output: &mut String) {
        let _ = writeln!(output, "# DSLX Evaluation Scorecard\n");
    }

    /// Writes the run summary table.
    fn write_summary(&self, output: &mut String) {
        let run = &self.report.run;
        let passed = self
            .report
            .entries
            .iter()
            .filter(|e| e.final_outcome.is_success())
            .count();

        let _ = writeln!(output, "## Summary\n");
        let _ = writeln!(output, "| Metric | Value |");
        let _ = writeln!(output, "|--------|-------|");
        let _ = writeln!(output, "| Models | {} |", self.report.models.len());
        let _ = writeln!(output, "| Pairs Evaluated | {} |", self.report.pair_count());
        let _ = writeln!(output, "| Pairs Passed | {passed} |");
        let _ = writeln!(output, "| Max Attempts | {} |", run.max_retries);
        let _ = writeln!(
            output,
            "| Critic | {} |",
            run.critic_model
                .as_deref()
                .map_or_else(|| "none".to_string(), escape_markdown)
        );
        let _ = writeln!(
            output,
            "| Duration | {} |",
            format_duration(run.duration_seconds)
        );
        let _ = writeln!(output);
    }

    /// Writes the per-model table.
    fn write_models(&self, output: &mut String) {
        let _ = writeln!(output, "## Models\n");

        if self.report.models.is_empty() {
            let _ = writeln!(output, "*No samples were evaluated.*\n");
            return;
        }

        let _ = writeln!(
            output,
            "| Model | Samples | Passed | Pass Rate | First Attempt | Mean Attempts | Tokens |"
        );
        let _ = writeln!(
            output,
            "|-------|---------|--------|-----------|---------------|---------------|--------|"
        );
        for model in &self.report.models {
            let mean = model
                .mean_attempts_to_pass
                .map_or_else(|| "-".to_string(), |m| format!("{m:.2}"));
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {mean} | {} |",
                escape_markdown(&model.model_id),
                model.samples,
                model.passed,
                format_rate(model.pass_rate),
                format_rate(model.first_attempt_pass_rate),
                model.total_tokens,
            );
        }
        let _ = writeln!(output);

        for model in &self.report.models {
            let breakdown: Vec<String> = FinalOutcome::ALL
                .iter()
                .filter(|o| model.outcomes.get(**o) > 0)
                .map(|o| format!("{} {}", model.outcomes.get(*o), o.reason_code()))
                .collect();
            let _ = writeln!(
                output,
                "- **{}**: {}",
                escape_markdown(&model.model_id),
                escape_markdown(&breakdown.join(", "))
            );
        }
        let _ = writeln!(output);
    }

    /// Writes one row per (sample, model) pair.
    fn write_samples(&self, output: &mut String) {
        let _ = writeln!(output, "## Samples\n");

        if self.report.entries.is_empty() {
            let _ = writeln!(output, "*No samples were evaluated.*\n");
            return;
        }

        let _ = writeln!(
            output,
            "| Sample | Model | Outcome | Attempts | History | Requirements | Detail |"
        );
        let _ = writeln!(
            output,
            "|--------|-------|---------|----------|---------|--------------|--------|"
        );
        for entry in &self.report.entries {
            Self::write_sample_row(output, entry);
        }
        let _ = writeln!(output);
    }

    fn write_sample_row(output: &mut String, entry: &ScorecardEntry) {
        let history: Vec<&str> = entry.attempt_outcomes.iter().map(|o| o.label()).collect();
        let requirements = if entry.requirement_ids.is_empty() {
            "-".to_string()
        } else {
            let passed = entry
                .verdicts
                .iter()
                .filter(|v| v.verdict == crate::Verdict::Pass)
                .count();
            format!("{passed}/{}", entry.requirement_ids.len())
        };
        let detail = entry
            .detail
            .as_deref()
            .map_or_else(String::new, |d| escape_markdown(&truncate_output(d, MAX_CELL_LENGTH)));

        let _ = writeln!(
            output,
            "| `{}` | {} | {} | {} | {} | {requirements} | {detail} |",
            escape_markdown_inline_code(&entry.sample_id),
            escape_markdown(&entry.model_id),
            entry.final_outcome.description(),
            entry.attempts_consumed,
            escape_markdown(&history.join(" → ")),
        );
    }

    /// Writes the requirement aggregate table.
    fn write_requirements(&self, output: &mut String) {
        let _ = writeln!(output, "## Requirements\n");

        if self.report.requirements.is_empty() {
            let _ = writeln!(output, "*No structural requirements declared.*\n");
            return;
        }

        let _ = writeln!(
            output,
            "| Requirement | Declared | Pass | Fail | Uncertain | Unevaluated | Pass Rate |"
        );
        let _ = writeln!(
            output,
            "|-------------|----------|------|------|-----------|-------------|-----------|"
        );
        for req in &self.report.requirements {
            let _ = writeln!(
                output,
                "| `{}` | {} | {} | {} | {} | {} | {} |",
                escape_markdown_inline_code(&req.requirement_id),
                req.declared,
                req.passed,
                req.failed,
                req.uncertain,
                req.unevaluated,
                format_rate(req.pass_rate),
            );
        }
        let _ = writeln!(output);
    }

    /// Writes critic rationales grouped by pair.
    fn write_verdicts(&self, output: &mut String) {
        let judged: Vec<_> = self
            .report
            .entries
            .iter()
            .filter(|e| !e.verdicts.is_empty())
            .collect();
        if judged.is_empty() {
            return;
        }

        let _ = writeln!(output, "## Critic Verdicts\n");
        for entry in judged {
            let _ = writeln!(
                output,
                "### {} / {}\n",
                escape_markdown(&entry.sample_id),
                escape_markdown(&entry.model_id)
            );
            for verdict in &entry.verdicts {
                let confidence = verdict
                    .confidence
                    .map_or_else(String::new, |c| format!(" ({c:.2})"));
                let _ = writeln!(
                    output,
                    "- `{}`: **{}**{confidence}: {}",
                    escape_markdown_inline_code(&verdict.requirement_id),
                    verdict.verdict,
                    escape_markdown(&truncate_output(&verdict.rationale, MAX_CELL_LENGTH)),
                );
            }
            let _ = writeln!(output);
        }
    }

    /// Writes the report footer.
    fn write_footer(output: &mut String) {
        let _ = writeln!(output, "---");
        let timestamp = format_timestamp(&Utc::now());
        let _ = writeln!(output, "*Generated by dslx-eval at {timestamp}*");
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Formats a duration in seconds to a human-readable string.
///
/// Examples:
/// - 65 seconds -> "1m 5s"
/// - 3661 seconds -> "1h 1m 1s"
/// - 45 seconds -> "45s"
fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();

    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }

    parts.join(" ")
}

/// Formats a timestamp as "YYYY-MM-DD HH:MM:SS UTC".
fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Formats a 0..=1 ratio as a percentage with one decimal.
fn format_rate(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Escapes special Markdown characters in text.
fn escape_markdown(text: &str) -> String {
    let mut result = String::with_capacity(text.len());

    for ch in text.chars() {
        match ch {
            '*' | '_' | '`' | '#' | '[' | ']' | '(' | ')' | '!' | '\\' | '<' | '>' | '|' => {
                result.push('\\');
                result.push(ch);
            }
            '\n' => result.push_str("<br>"),
            _ => result.push(ch),
        }
    }

    result
}

/// Escapes backticks in text intended for inline code.
fn escape_markdown_inline_code(text: &str) -> String {
    text.replace('`', "'")
}

/// Keeps the first line of `output`, cut at a char boundary to `max_length` bytes.
fn truncate_output(output: &str, max_length: usize) -> String {
    let first_line = output.lines().next().unwrap_or("");

    if first_line.len() <= max_length {
        first_line.to_string()
    } else {
        let truncate_at = first_line
            .char_indices()
            .take_while(|(idx, _)| *idx < max_length)
            .last()
            .map_or(0, |(idx, c)| idx + c.len_utf8());
        format!("{}...", &first_line[..truncate_at])
    }
}

// ============================================================================
// Tests
// ============================================================================
