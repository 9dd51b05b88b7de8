//! Structural requirement judgement by a second model.
//!
//! Passing the acceptance tests says nothing about *how* a function is built.
//! Samples may declare structural requirements ("use a Kogge-Stone prefix
//! network") and the critic judges each one separately from the final code.

use dslx_eval_report::{AuditLlmCall, LlmCallPurpose, RequirementVerdict, Verdict};
use futures::future::join_all;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CriticConfig;
use crate::extract::{fenced_blocks, SourceFragment};
use crate::model::ModelClient;
use crate::prompt::Conversation;
use crate::sample::{RequirementSpec, Sample};

/// System instructions sent with every critic request.
pub const CRITIC_INSTRUCTIONS: &str = "\
You are a strict requirements checker for DSLX code.

You will be given a problem statement, a function signature, ONE requirement and a \
candidate implementation. Decide whether the implementation meets that requirement.

Rules:
- Treat comments as claims, not proof.
- Decide from the actual code structure: which values are combined and how each \
stage depends on the previous one, not merely which indices a loop visits.
- A loop that visits every index is not evidence of a dense structure if most \
iterations only copy state or skip the combining operation.
- If you cannot find concrete evidence that the requirement is met, do not answer pass.

Reply with ONLY a JSON object of this form:
{\"verdict\": \"pass\" | \"fail\" | \"uncertain\", \"confidence\": 0.0 to 1.0, \"rationale\": \"short reason\"}
";

/// Knobs for a [`CriticEvaluator`].
#[derive(Debug, Clone, Copy)]
pub struct CriticSettings {
    /// Re-asks after a malformed reply.
    pub json_retries: u32,
    /// Lowest confidence at which `pass` is accepted.
    pub min_confidence: f64,
}

impl CriticSettings {
    /// Takes the relevant values from the critic configuration.
    #[must_use]
    pub const fn from_config(config: &CriticConfig) -> Self {
        Self {
            json_retries: config.json_retries,
            min_confidence: config.min_confidence,
        }
    }
}

impl Default for CriticSettings {
    fn default() -> Self {
        Self::from_config(&CriticConfig::default())
    }
}

/// Verdicts for one sample plus the calls made to get them.
#[derive(Debug, Clone, Default)]
pub struct CriticReport {
    /// One verdict per requirement, in declaration order.
    pub verdicts: Vec<RequirementVerdict>,
    /// Critic model calls.
    pub llm_calls: Vec<AuditLlmCall>,
}

/// Shape of a critic reply.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: String,
}

/// Judges requirements with a critic model.
pub struct CriticEvaluator<'a> {
    model: &'a dyn ModelClient,
    settings: CriticSettings,
    reference: Option<&'a str>,
}

impl<'a> CriticEvaluator<'a> {
    /// Creates an evaluator.
    #[must_use]
    pub fn new(model: &'a dyn ModelClient, settings: CriticSettings) -> Self {
        Self {
            model,
            settings,
            reference: None,
        }
    }

    /// Appends a DSLX language reference to the critic instructions.
    #[must_use]
    pub fn with_reference(mut self, reference: &'a str) -> Self {
        self.reference = Some(reference).filter(|r| !r.trim().is_empty());
        self
    }

    fn instructions(&self) -> String {
        match self.reference {
            Some(reference) => format!("{CRITIC_INSTRUCTIONS}\n{}\n", reference.trim_end()),
            None => CRITIC_INSTRUCTIONS.to_string(),
        }
    }

    /// Judges every requirement of `sample` against `fragment`.
    ///
    /// Requirements are judged concurrently and independently. The result
    /// always holds exactly one verdict per requirement.
    #[instrument(skip_all, fields(sample = %sample.id, critic = %self.model.model_id()))]
    pub async fn evaluate(
        &self,
        sample: &Sample,
        fragment: &SourceFragment,
        cancel: &CancellationToken,
    ) -> CriticReport {
        let judgements = join_all(
            sample
                .requirements
                .iter()
                .map(|requirement| self.judge(sample, requirement, fragment, cancel)),
        )
        .await;

        let mut report = CriticReport::default();
        for (verdict, calls) in judgements {
            report.verdicts.push(verdict);
            report.llm_calls.extend(calls);
        }
        info!(
            requirements = report.verdicts.len(),
            passed = report
                .verdicts
                .iter()
                .filter(|v| v.verdict == Verdict::Pass)
                .count(),
            "Critic finished"
        );
        report
    }

    async fn judge(
        &self,
        sample: &Sample,
        requirement: &RequirementSpec,
        fragment: &SourceFragment,
        cancel: &CancellationToken,
    ) -> (RequirementVerdict, Vec<AuditLlmCall>) {
        let mut conversation = Conversation::new(
            self.instructions(),
            request_text(sample, requirement, fragment),
        );
        let mut calls = Vec::new();

        for round in 0..=self.settings.json_retries {
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    return (RequirementVerdict::uncertain(&requirement.id, "cancelled"), calls);
                }
                result = self.model.generate(&conversation) => result,
            };

            let completion = match result {
                Ok(completion) => completion,
                Err(e) => {
                    warn!(requirement = %requirement.id, error = %e, "Critic call failed");
                    return (
                        RequirementVerdict::uncertain(&requirement.id, format!("critic error: {e}")),
                        calls,
                    );
                }
            };
            calls.push(AuditLlmCall::new(
                self.model.model_id(),
                LlmCallPurpose::Critic,
                completion.prompt_tokens,
                completion.completion_tokens,
                completion.duration_ms,
            ));

            match parse_verdict(&completion.text) {
                Ok(raw) => {
                    let verdict = self.finish(&requirement.id, raw);
                    debug!(requirement = %requirement.id, verdict = %verdict.verdict, "Requirement judged");
                    return (verdict, calls);
                }
                Err(message) => {
                    debug!(requirement = %requirement.id, round, error = %message, "Malformed critic reply");
                    conversation.push_candidate(completion.text);
                    conversation.push_feedback(format!(
                        "Your previous response was not valid JSON in the required form. \
                         Parsing error: {message}\nReply with only the JSON object."
                    ));
                }
            }
        }

        (
            RequirementVerdict::uncertain(
                &requirement.id,
                format!(
                    "critic reply was not valid JSON after {} attempts",
                    self.settings.json_retries + 1
                ),
            ),
            calls,
        )
    }

    /// Applies the confidence floor to a parsed reply. A pass without a
    /// confidence counts as zero confidence.
    fn finish(&self, id: &str, raw: ParsedVerdict) -> RequirementVerdict {
        let ParsedVerdict {
            verdict,
            confidence,
            rationale,
        } = raw;

        let below_floor = !confidence.is_some_and(|c| c >= self.settings.min_confidence);
        let verdict = if verdict == Verdict::Pass && below_floor {
            RequirementVerdict::uncertain(
                id,
                format!(
                    "pass below confidence floor {}: {rationale}",
                    self.settings.min_confidence
                ),
            )
        } else {
            RequirementVerdict::new(id, verdict, rationale)
        };

        match confidence {
            Some(c) => verdict.with_confidence(c),
            None => verdict,
        }
    }
}

/// The single user turn of a critic conversation.
fn request_text(sample: &Sample, requirement: &RequirementSpec, fragment: &SourceFragment) -> String {
    format!(
        "Problem:\n{}\n\nSignature:\n```dslx\n{}\n```\n\nRequirement ({}):\n{}\n\n\
         Candidate implementation:\n```dslx\n{}\n```\n",
        sample.prompt.trim(),
        sample.signature.trim(),
        requirement.id,
        requirement.text.trim(),
        fragment.as_str().trim_end(),
    )
}

/// A critic reply that passed validation.
#[derive(Debug, Clone, PartialEq)]
struct ParsedVerdict {
    verdict: Verdict,
    confidence: Option<f64>,
    rationale: String,
}

/// Parses a reply, accepting a JSON object optionally wrapped in one fence.
fn parse_verdict(text: &str) -> std::result::Result<ParsedVerdict, String> {
    let body = fenced_blocks(text)
        .into_iter()
        .next()
        .map_or_else(|| text.trim().to_string(), |block| block.body.trim().to_string());
    if body.is_empty() {
        return Err("empty response".to_string());
    }

    let raw: RawVerdict = serde_json::from_str(&body).map_err(|e| e.to_string())?;
    let verdict = Verdict::from_str_case_insensitive(&raw.verdict)
        .ok_or_else(|| format!("unknown verdict '{}'", raw.verdict))?;
    if let Some(c) = raw.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(format!("confidence {c} is outside 0..1"));
        }
    }

    Ok(ParsedVerdict {
        verdict,
        confidence: raw.confidence,
        rationale: raw.rationale,
    })
}
