//! Evaluation pipeline.
//!
//! [`Evaluation::run`] fans every (sample, model) pair out to its own task,
//! bounded by `concurrency` permits. Each task owns its conversation and
//! toolchain runs; only the scorecard is shared. One pair failing, even by
//! panicking, never stops the others.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dslx_eval_report::{FinalOutcome, Report, RunInfo, Scorecard, ScorecardEntry};
use dslx_eval_toolchain::Toolchain;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::artifacts::ArtifactWriter;
use crate::config::Config;
use crate::critic::{CriticEvaluator, CriticSettings};
use crate::error::Result;
use crate::extract::CodeExtractor;
use crate::model::ModelClient;
use crate::retry::{RetryController, RetrySettings};
use crate::sample::{Sample, SampleRepository};
use crate::tutorial::Tutorial;

/// A loaded sample, or why it could not be loaded.
type LoadedSample = std::result::Result<Arc<Sample>, String>;

/// Everything a pair task needs, shared between tasks.
struct Shared {
    preamble: String,
    critic_reference: String,
    toolchain: Arc<dyn Toolchain>,
    critic: Option<Arc<dyn ModelClient>>,
    extractor: CodeExtractor,
    retry: RetrySettings,
    critic_settings: CriticSettings,
    artifacts: Option<ArtifactWriter>,
    scorecard: Mutex<Scorecard>,
}

/// One configured evaluation run.
pub struct Evaluation {
    config: Config,
    preamble: String,
    critic_reference: String,
    repository: SampleRepository,
    models: Vec<Arc<dyn ModelClient>>,
    critic: Option<Arc<dyn ModelClient>>,
    toolchain: Arc<dyn Toolchain>,
    artifacts: Option<ArtifactWriter>,
}

impl Evaluation {
    /// Creates an evaluation of `models` over samples from `repository`.
    #[must_use]
    pub fn new(
        config: Config,
        tutorial: &Tutorial,
        repository: SampleRepository,
        models: Vec<Arc<dyn ModelClient>>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        let artifacts = config.artifacts_dir.as_ref().map(ArtifactWriter::new);
        Self {
            preamble: tutorial.preamble(),
            critic_reference: tutorial.critic_reference(),
            config,
            repository,
            models,
            critic: None,
            toolchain,
            artifacts,
        }
    }

    /// Judges requirements of passing pairs with `critic`.
    #[must_use]
    pub fn with_critic(mut self, critic: Arc<dyn ModelClient>) -> Self {
        self.critic = Some(critic);
        self
    }

    /// Runs every pair and returns the summarized report.
    ///
    /// Samples are loaded once up front and repeated ids are evaluated once.
    /// A malformed sample is recorded as
    /// `malformed_sample` for every model. Pairs still running when `cancel`
    /// fires are recorded as `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::SampleNotFound` or `EvalError::Io` if a selected
    /// sample cannot be read at all. Nothing is run in that case.
    #[instrument(skip_all, fields(samples = sample_ids.len(), models = self.models.len()))]
    pub async fn run(self, sample_ids: &[String], cancel: CancellationToken) -> Result<Report> {
        let started = Instant::now();
        let samples = self.load_samples(sample_ids)?;

        let run_info = RunInfo {
            max_retries: self.config.max_retries,
            critic_model: self.critic.as_ref().map(|c| c.model_id().to_string()),
            duration_seconds: 0,
        };
        let shared = Arc::new(Shared {
            preamble: self.preamble,
            critic_reference: self.critic_reference,
            toolchain: self.toolchain,
            critic: self.critic,
            extractor: CodeExtractor::new(self.config.extractor.language_tags.clone()),
            retry: RetrySettings::from_config(&self.config),
            critic_settings: CriticSettings::from_config(&self.config.critic),
            artifacts: self.artifacts,
            scorecard: Mutex::new(Scorecard::with_run_info(run_info)),
        });
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for model in &self.models {
            for (sample_id, loaded) in &samples {
                let sample = match loaded {
                    Ok(sample) => Arc::clone(sample),
                    Err(message) => {
                        record_malformed(&shared, sample_id, model.model_id(), message).await;
                        continue;
                    }
                };

                let shared = Arc::clone(&shared);
                let model = Arc::clone(model);
                let permits = Arc::clone(&permits);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let pair = AssertUnwindSafe(evaluate_pair(&shared, &sample, model.as_ref(), &cancel))
                        .catch_unwind()
                        .await;
                    let entry = match pair {
                        Ok(entry) => entry,
                        Err(_) => {
                            error!(sample = %sample.id, model = %model.model_id(), "Pair task panicked");
                            ScorecardEntry::builder()
                                .sample_id(&sample.id)
                                .model_id(model.model_id())
                                .final_outcome(FinalOutcome::Exhausted)
                                .requirement_ids(sample.requirement_ids())
                                .detail("evaluation task panicked")
                                .build()
                                .map_err(Into::into)
                        }
                    };
                    match entry {
                        Ok(entry) => record(&shared, entry).await,
                        Err(e) => error!(sample = %sample.id, error = %e, "Could not build scorecard entry"),
                    }
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pair task failed to join");
            }
        }

        let mut report = shared.scorecard.lock().await.summarize();
        report.run.duration_seconds = started.elapsed().as_secs();
        info!(
            pairs = report.pair_count(),
            all_passed = report.all_passed(),
            duration_seconds = report.run.duration_seconds,
            "Evaluation finished"
        );
        Ok(report)
    }

    fn load_samples(&self, ids: &[String]) -> Result<Vec<(String, LoadedSample)>> {
        let mut samples = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                debug!(sample = %id, "Skipping repeated sample id");
                continue;
            }
            let loaded = match self.repository.load(id) {
                Ok(sample) => Ok(Arc::new(sample)),
                Err(e) if e.is_sample_error() => {
                    warn!(sample = %id, error = %e, "Malformed sample");
                    Err(e.to_string())
                }
                Err(e) => return Err(e),
            };
            samples.push((id.clone(), loaded));
        }
        Ok(samples)
    }
}

/// Runs the retry loop, the critic and the artifact writer for one pair.
async fn evaluate_pair(
    shared: &Shared,
    sample: &Sample,
    model: &dyn ModelClient,
    cancel: &CancellationToken,
) -> Result<ScorecardEntry> {
    let controller = RetryController::new(
        model,
        shared.toolchain.as_ref(),
        &shared.extractor,
        &shared.retry,
    );
    let run = controller.run(sample, &shared.preamble, cancel).await;

    let mut llm_calls = run.llm_calls.clone();
    let mut verdicts = Vec::new();
    if let (Some(critic), Some(fragment)) = (&shared.critic, run.final_fragment()) {
        if sample.has_requirements() {
            let report = CriticEvaluator::new(critic.as_ref(), shared.critic_settings)
                .with_reference(&shared.critic_reference)
                .evaluate(sample, fragment, cancel)
                .await;
            verdicts = report.verdicts;
            llm_calls.extend(report.llm_calls);
        }
    }

    if let Some(writer) = &shared.artifacts {
        if let Err(e) = writer.write_run(&run).await {
            warn!(sample = %sample.id, error = %e, "Could not write artifacts");
        }
    }

    let mut builder = ScorecardEntry::builder()
        .sample_id(&run.sample_id)
        .model_id(&run.model_id)
        .final_outcome(run.final_outcome)
        .attempts(run.attempt_outcomes())
        .requirement_ids(sample.requirement_ids())
        .verdicts(verdicts)
        .llm_calls(llm_calls);
    if let Some(detail) = &run.detail {
        builder = builder.detail(detail);
    }
    Ok(builder.build()?)
}

async fn record_malformed(shared: &Shared, sample_id: &str, model_id: &str, message: &str) {
    let entry = ScorecardEntry::builder()
        .sample_id(sample_id)
        .model_id(model_id)
        .final_outcome(FinalOutcome::MalformedSample)
        .detail(message)
        .build();
    match entry {
        Ok(entry) => record(shared, entry).await,
        Err(e) => error!(sample = %sample_id, error = %e, "Could not build scorecard entry"),
    }
}

async fn record(shared: &Shared, entry: ScorecardEntry) {
    let mut scorecard = shared.scorecard.lock().await;
    if let Err(e) = scorecard.record(entry) {
        warn!(error = %e, "Scorecard entry rejected");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use dslx_eval_report::{AttemptOutcome, Verdict};
    use dslx_eval_toolchain::OutcomeKind;

    use super::*;
    use crate::error::EvalError;
    use crate::test_support::{Reply, ScriptedModel, ScriptedToolchain};

    const ADD: &str = "\
## Prompt
Add two numbers.

## Signature
```dslx-snippet
fn add(a: u32, b: u32) -> u32
```

## Tests
```dslx-snippet
#[test]
fn test_add() { assert_eq(add(u32:1, u32:2), u32:3) }
```

## Requirements
- id: single_adder
  requirement: Use exactly one adder.
";

    fn fixture(dir: &Path) -> SampleRepository {
        std::fs::write(dir.join("add.md"), ADD).unwrap();
        std::fs::write(dir.join("sub.md"), ADD.replace("Add two", "Subtract two")).unwrap();
        std::fs::write(dir.join("broken.md"), "## Prompt\nmissing sections\n").unwrap();
        SampleRepository::new(dir)
    }

    fn config(max_retries: u32) -> Config {
        Config {
            max_retries,
            concurrency: 2,
            ..Config::default()
        }
    }

    fn model(id: &str, replies: Vec<Reply>) -> Arc<dyn ModelClient> {
        Arc::new(ScriptedModel::new(id, replies))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_every_pair_recorded_once() {
        let temp = tempfile::tempdir().unwrap();
        let repository = fixture(temp.path());
        let tutorial = Tutorial::from_text("tutorial");

        let evaluation = Evaluation::new(
            config(3),
            &tutorial,
            repository,
            vec![
                model("good", vec![Reply::code("fn add(a: u32, b: u32) -> u32 { a + b }")]),
                model("silent", vec![Reply::Text("no idea".to_string())]),
            ],
            Arc::new(ScriptedToolchain::always(OutcomeKind::Passed)),
        );

        let report = evaluation
            .run(&ids(&["add", "sub", "broken"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pair_count(), 6);
        let outcome = |sample: &str, model: &str| {
            report
                .entries
                .iter()
                .find(|e| e.sample_id == sample && e.model_id == model)
                .unwrap()
                .final_outcome
        };
        assert_eq!(outcome("add", "good"), FinalOutcome::Passed);
        assert_eq!(outcome("sub", "good"), FinalOutcome::Passed);
        assert_eq!(outcome("add", "silent"), FinalOutcome::Exhausted);
        assert_eq!(outcome("broken", "good"), FinalOutcome::MalformedSample);
        assert_eq!(outcome("broken", "silent"), FinalOutcome::MalformedSample);

        let silent = report.models.iter().find(|m| m.model_id == "silent").unwrap();
        assert_eq!(silent.passed, 0);
        let good = report.models.iter().find(|m| m.model_id == "good").unwrap();
        assert_eq!(good.samples, 3);
        assert_eq!(good.passed, 2);
        assert!(!report.all_passed());
        assert_eq!(report.run.max_retries, 3);
    }

    #[tokio::test]
    async fn test_missing_sample_aborts_before_running() {
        let temp = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(ScriptedToolchain::always(OutcomeKind::Passed));
        let evaluation = Evaluation::new(
            config(3),
            &Tutorial::from_text("t"),
            fixture(temp.path()),
            vec![model("m", vec![Reply::code("fn add() {}")])],
            toolchain.clone(),
        );

        let err = evaluation
            .run(&ids(&["add", "nope"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::SampleNotFound { .. }));
        assert_eq!(toolchain.runs(), 0);
    }

    #[tokio::test]
    async fn test_critic_judges_passing_pairs_only() {
        let temp = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(ScriptedToolchain::always(OutcomeKind::RuntimeFailure));
        let critic = Arc::new(ScriptedModel::new(
            "critic",
            vec![Reply::Text(r#"{"verdict":"pass","confidence":0.9,"rationale":"ok"}"#.to_string())],
        ));

        let evaluation = Evaluation::new(
            config(2),
            &Tutorial::from_text("t"),
            fixture(temp.path()),
            vec![model("m", vec![Reply::code("fn add() {}")])],
            toolchain,
        )
        .with_critic(critic.clone());

        let report = evaluation
            .run(&ids(&["add"]), CancellationToken::new())
            .await
            .unwrap();

        let entry = &report.entries[0];
        assert_eq!(entry.final_outcome, FinalOutcome::Exhausted);
        assert_eq!(entry.attempt_outcomes, [AttemptOutcome::RuntimeFailure; 2]);
        assert!(entry.verdicts.is_empty());
        assert_eq!(critic.calls(), 0);
        assert_eq!(report.run.critic_model.as_deref(), Some("critic"));
        assert_eq!(report.requirements[0].unevaluated, 1);
    }

    #[tokio::test]
    async fn test_critic_verdicts_recorded_for_passing_pair() {
        let temp = tempfile::tempdir().unwrap();
        let critic = Arc::new(ScriptedModel::new(
            "critic",
            vec![Reply::Text(r#"{"verdict":"fail","confidence":0.9,"rationale":"two adders"}"#.to_string())],
        ));

        let evaluation = Evaluation::new(
            config(2),
            &Tutorial::from_text("t"),
            fixture(temp.path()),
            vec![model("m", vec![Reply::code("fn add(a: u32, b: u32) -> u32 { a + b }")])],
            Arc::new(ScriptedToolchain::always(OutcomeKind::Passed)),
        )
        .with_critic(critic.clone());

        let report = evaluation
            .run(&ids(&["add"]), CancellationToken::new())
            .await
            .unwrap();

        let entry = &report.entries[0];
        assert_eq!(entry.final_outcome, FinalOutcome::Passed);
        assert_eq!(entry.verdicts.len(), 1);
        assert_eq!(entry.verdicts[0].verdict, Verdict::Fail);
        assert_eq!(entry.llm_calls.len(), 2);
        assert!(report.all_passed());
        assert!(!report.all_passed_strict());
    }

    #[tokio::test]
    async fn test_critic_sees_tutorial_reference() {
        let temp = tempfile::tempdir().unwrap();
        let critic = Arc::new(ScriptedModel::new(
            "critic",
            vec![Reply::Text(r#"{"verdict":"pass","confidence":0.9,"rationale":"ok"}"#.to_string())],
        ));
        let tutorial = Tutorial::from_text("# DSLX\n\nArrays are immutable; use `update`.\n");

        let evaluation = Evaluation::new(
            config(1),
            &tutorial,
            fixture(temp.path()),
            vec![model("m", vec![Reply::code("fn add(a: u32, b: u32) -> u32 { a + b }")])],
            Arc::new(ScriptedToolchain::always(OutcomeKind::Passed)),
        )
        .with_critic(critic.clone());

        evaluation
            .run(&ids(&["add"]), CancellationToken::new())
            .await
            .unwrap();

        let seen = critic.seen.lock().unwrap();
        let system = &seen[0].turns()[0].text;
        assert!(system.contains("DSLX language reference (excerpt):"));
        assert!(system.contains("Arrays are immutable; use `update`."));
    }

    #[tokio::test]
    async fn test_repeated_sample_ids_evaluated_once() {
        let temp = tempfile::tempdir().unwrap();
        let generator = Arc::new(ScriptedModel::new(
            "m",
            vec![Reply::code("fn add(a: u32, b: u32) -> u32 { a + b }")],
        ));
        let toolchain = Arc::new(ScriptedToolchain::always(OutcomeKind::Passed));

        let evaluation = Evaluation::new(
            config(3),
            &Tutorial::from_text("t"),
            fixture(temp.path()),
            vec![generator.clone() as Arc<dyn ModelClient>],
            toolchain.clone(),
        );

        let report = evaluation
            .run(&ids(&["add", "sub", "add"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pair_count(), 2);
        assert_eq!(generator.calls(), 2);
        assert_eq!(toolchain.runs(), 2);
        let mut recorded: Vec<_> = report.entries.iter().map(|e| e.sample_id.as_str()).collect();
        recorded.sort_unstable();
        assert_eq!(recorded, ["add", "sub"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_still_records_every_pair() {
        let temp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let evaluation = Evaluation::new(
            config(3),
            &Tutorial::from_text("t"),
            fixture(temp.path()),
            vec![model("m", vec![Reply::Hang])],
            Arc::new(ScriptedToolchain::always(OutcomeKind::Passed)),
        );

        let report = evaluation.run(&ids(&["add", "sub"]), cancel).await.unwrap();

        assert_eq!(report.pair_count(), 2);
        assert!(report
            .entries
            .iter()
            .all(|e| e.final_outcome == FinalOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_artifacts_written_when_configured() {
        let temp = tempfile::tempdir().unwrap();
        let samples = temp.path().join("samples");
        std::fs::create_dir_all(&samples).unwrap();
        let artifacts = temp.path().join("artifacts");
        let config = Config {
            artifacts_dir: Some(artifacts.to_string_lossy().into_owned()),
            ..config(1)
        };

        let evaluation = Evaluation::new(
            config,
            &Tutorial::from_text("t"),
            fixture(&samples),
            vec![model("m", vec![Reply::code("fn add(a: u32, b: u32) -> u32 { a + b }")])],
            Arc::new(ScriptedToolchain::always(OutcomeKind::Passed)),
        );

        evaluation
            .run(&ids(&["add"]), CancellationToken::new())
            .await
            .unwrap();

        assert!(artifacts.join("m").join("add").join("attempt-1.x").exists());
    }
}
