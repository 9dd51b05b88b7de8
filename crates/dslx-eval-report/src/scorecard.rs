//! Append-only scorecard of evaluation outcomes.
//!
//! Each (sample, model) pair is recorded exactly once. [`Scorecard::summarize`]
//! turns the recorded entries into a [`Report`] with per-model and
//! per-requirement aggregates.

use std::collections::{BTreeMap, HashSet};

use crate::{
    ratio, ModelSummary, OutcomeCounts, Report, ReportError, RequirementSummary, Result, RunInfo,
    ScorecardEntry, Verdict,
};

/// Collects terminal entries for one evaluation run.
#[derive(Debug, Clone, Default)]
pub struct Scorecard {
    run: RunInfo,
    entries: Vec<ScorecardEntry>,
    recorded: HashSet<(String, String)>,
}

impl Scorecard {
    /// Creates an empty scorecard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty scorecard carrying run metadata into its report.
    #[must_use]
    pub fn with_run_info(run: RunInfo) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    /// Records a terminal entry.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::DuplicateEntry`] if the (sample, model) pair has
    /// already been recorded. The existing entry is left untouched.
    pub fn record(&mut self, entry: ScorecardEntry) -> Result<()> {
        let key = (entry.sample_id.clone(), entry.model_id.clone());
        if self.recorded.contains(&key) {
            return Err(ReportError::DuplicateEntry {
                sample_id: key.0,
                model_id: key.1,
            });
        }
        self.recorded.insert(key);
        self.entries.push(entry);
        Ok(())
    }

    /// Returns `true` if the pair has been recorded.
    #[must_use]
    pub fn contains(&self, sample_id: &str, model_id: &str) -> bool {
        self.recorded
            .contains(&(sample_id.to_string(), model_id.to_string()))
    }

    /// Returns the recorded entries in recording order.
    #[must_use]
    pub fn entries(&self) -> &[ScorecardEntry] {
        &self.entries
    }

    /// Returns the number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Computes the run report.
    ///
    /// Pass rate per model is the number of `passed` entries divided by the
    /// number of entries recorded for that model. Mean attempts-to-pass only
    /// counts passing entries. Requirement aggregates count every entry whose
    /// sample declares the requirement, so a pair that never compiled lowers
    /// the requirement pass rate as "unevaluated".
    #[must_use]
    pub fn summarize(&self) -> Report {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| {
            a.model_id
                .cmp(&b.model_id)
                .then_with(|| a.sample_id.cmp(&b.sample_id))
        });

        Report {
            run: self.run.clone(),
            models: summarize_models(&entries),
            requirements: summarize_requirements(&entries),
            entries,
        }
    }
}

fn summarize_models(entries: &[ScorecardEntry]) -> Vec<ModelSummary> {
    let mut by_model: BTreeMap<&str, Vec<&ScorecardEntry>> = BTreeMap::new();
    for entry in entries {
        by_model.entry(entry.model_id.as_str()).or_default().push(entry);
    }

    by_model
        .into_iter()
        .map(|(model_id, entries)| {
            let mut outcomes = OutcomeCounts::default();
            for entry in &entries {
                outcomes.add(entry.final_outcome);
            }

            let passing: Vec<_> = entries
                .iter()
                .filter(|e| e.final_outcome.is_success())
                .collect();
            let first_attempt_passes = entries.iter().filter(|e| e.passed_first_attempt()).count();
            let mean_attempts_to_pass = if passing.is_empty() {
                None
            } else {
                let total: usize = passing.iter().map(|e| e.attempts_consumed as usize).sum();
                Some(ratio(total, passing.len()))
            };

            ModelSummary {
                model_id: model_id.to_string(),
                samples: entries.len(),
                passed: passing.len(),
                pass_rate: ratio(passing.len(), entries.len()),
                first_attempt_passes,
                first_attempt_pass_rate: ratio(first_attempt_passes, entries.len()),
                mean_attempts_to_pass,
                outcomes,
                llm_calls: entries.iter().map(|e| e.llm_calls.len()).sum(),
                total_tokens: entries
                    .iter()
                    .flat_map(|e| e.llm_calls.iter())
                    .map(crate::AuditLlmCall::total_tokens)
                    .sum(),
            }
        })
        .collect()
}

fn summarize_requirements(entries: &[ScorecardEntry]) -> Vec<RequirementSummary> {
    let mut by_id: BTreeMap<&str, RequirementSummary> = BTreeMap::new();

    for entry in entries {
        for id in &entry.requirement_ids {
            let summary = by_id.entry(id.as_str()).or_insert_with(|| RequirementSummary {
                requirement_id: id.clone(),
                ..RequirementSummary::default()
            });
            summary.declared += 1;

            match entry.verdicts.iter().find(|v| &v.requirement_id == id) {
                Some(v) => match v.verdict {
                    Verdict::Pass => summary.passed += 1,
                    Verdict::Fail => summary.failed += 1,
                    Verdict::Uncertain => summary.uncertain += 1,
                },
                None => summary.unevaluated += 1,
            }
        }
    }

    by_id
        .into_values()
        .map(|mut summary| {
            summary.pass_rate = ratio(summary.passed, summary.declared);
            summary
        })
        .collect()
}
