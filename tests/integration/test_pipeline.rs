//! End-to-end integration tests for the evaluation pipeline
//!
//! The model is the real HTTP client talking to a `wiremock` server. The
//! toolchain is an in-process double that judges modules by their text, so
//! these tests run without an XLS installation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dslx_eval_harness::{
    Config, Evaluation, ModelClient, OpenAiClient, SampleRepository, Tutorial,
};
use dslx_eval_report::{
    json::JsonGenerator, AttemptOutcome, FinalOutcome, MarkdownGenerator, Report, Verdict,
};
use dslx_eval_toolchain::{
    OutcomeKind, RunRequest, Stage, StageRecord, Toolchain, ToolchainError, ToolchainResult,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WRONG_POPCOUNT: &str = "```dslx\nfn popcount(x: u32) -> u32 { x }\n```";
const RIGHT_POPCOUNT: &str = "Here is the fix:\n\n```dslx\nfn popcount(x: u32) -> u32 { std::popcount(x) }\n```";

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/dslx-eval")
}

fn repository() -> SampleRepository {
    SampleRepository::new(fixture_path().join("samples"))
}

fn tutorial() -> Tutorial {
    Tutorial::load(fixture_path().join("prompt.md")).expect("Failed to load tutorial")
}

fn completion(content: &str) -> Value {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 200, "completion_tokens": 40 }
    })
}

fn config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.max_retries = 3;
    config.concurrency = 2;
    config.model.endpoint = format!("{}/v1/chat/completions", server.uri());
    config.model.backoff.base_ms = 1;
    config.model.backoff.max_ms = 5;
    config
}

fn client(model: &str, config: &Config) -> Arc<dyn ModelClient> {
    Arc::new(OpenAiClient::new(model, "sk-test", &config.model).expect("Failed to build client"))
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

// ============================================================================
// Toolchain double
// ============================================================================

/// Judges a module by looking for text that marks a correct answer.
struct TextToolchain {
    passing_marker: &'static str,
    modules: Mutex<Vec<String>>,
}

impl TextToolchain {
    fn new(passing_marker: &'static str) -> Self {
        Self {
            passing_marker,
            modules: Mutex::new(Vec::new()),
        }
    }

    fn record(stage: Stage, exit_code: i32, stderr: &str) -> StageRecord {
        StageRecord {
            stage,
            command: format!("{stage} /tmp/module.x --dslx_stdlib_path /stdlib"),
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 2,
            timed_out: false,
        }
    }
}

#[async_trait]
impl Toolchain for TextToolchain {
    async fn run(
        &self,
        request: &RunRequest,
        _cancel: &CancellationToken,
    ) -> Result<ToolchainResult, ToolchainError> {
        let module = request.module.as_str().to_string();
        self.modules.lock().unwrap().push(module.clone());

        let typecheck = Self::record(Stage::Typecheck, 0, "");
        let interpreter = if module.contains(self.passing_marker) {
            Self::record(Stage::Interpreter, 0, "")
        } else {
            Self::record(
                Stage::Interpreter,
                1,
                "[ RUN UNITTEST  ] test_popcount\nFAILED test_popcount: assert_eq failed: lhs: u32:11 rhs: u32:3",
            )
        };
        Ok(ToolchainResult::from_stages(typecheck, Some(interpreter), Utc::now()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_feedback_loop_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Error encountered"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(RIGHT_POPCOUNT)))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(WRONG_POPCOUNT)))
        .mount(&server)
        .await;

    let config = config(&server);
    let toolchain = Arc::new(TextToolchain::new("std::popcount"));
    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("gpt-4o", &config)],
        toolchain.clone(),
    );

    let report = evaluation
        .run(&ids(&["popcount"]), CancellationToken::new())
        .await
        .expect("Evaluation failed");

    let entry = &report.entries[0];
    assert_eq!(entry.final_outcome, FinalOutcome::Passed);
    assert_eq!(
        entry.attempt_outcomes,
        [AttemptOutcome::RuntimeFailure, AttemptOutcome::Passed]
    );
    assert_eq!(entry.llm_calls.len(), 2);
    assert!(report.all_passed());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let retry_body = String::from_utf8_lossy(&requests[1].body);
    assert!(retry_body.contains("FAILED test_popcount"));
    assert!(retry_body.contains("DSLX in Brief"));

    let modules = toolchain.modules.lock().unwrap();
    assert!(modules[1].contains("std::popcount(x)"));
    assert!(modules[1].contains("// -- tests"));
    assert!(!modules[1].contains("Here is the fix"));
}

#[tokio::test]
async fn test_reports_written_and_readable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(WRONG_POPCOUNT)))
        .mount(&server)
        .await;

    let config = config(&server);
    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("gpt-4o", &config)],
        Arc::new(TextToolchain::new("std::popcount")),
    );
    let report = evaluation
        .run(&ids(&["popcount"]), CancellationToken::new())
        .await
        .unwrap();

    let output = tempfile::tempdir().unwrap();
    let json_path = output.path().join("dslx-eval-report.json");
    JsonGenerator::new(&report).write_to_file(&json_path, true).unwrap();
    let markdown = MarkdownGenerator::new(&report).generate();

    let reloaded: Report = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(reloaded.pair_count(), 1);
    assert_eq!(reloaded.entries[0].final_outcome, FinalOutcome::Exhausted);
    assert_eq!(reloaded.entries[0].attempts_consumed, 3);
    assert_eq!(reloaded.models[0].passed, 0);

    assert!(markdown.contains("gpt-4o"));
    assert!(markdown.contains("popcount"));
}

#[tokio::test]
async fn test_critic_over_http() {
    let model_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "```dslx\nfn prefix_or(x: u1[N]) -> u1[N] {\n    // stage 1..3 of a Kogge-Stone network\n    x\n}\n```",
        )))
        .mount(&model_server)
        .await;

    let critic_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Requirement (log_depth)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"verdict": "fail", "confidence": 0.95, "rationale": "the comment claims stages but the body returns x"}"#,
        )))
        .mount(&critic_server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Requirement (no_ripple)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("I think it is fine.")))
        .mount(&critic_server)
        .await;

    let mut config = config(&model_server);
    config.critic.json_retries = 1;
    let mut critic_config = config.model.clone();
    critic_config.endpoint = format!("{}/v1/chat/completions", critic_server.uri());
    let critic: Arc<dyn ModelClient> =
        Arc::new(OpenAiClient::new("gpt-4o-critic", "sk-test", &critic_config).unwrap());

    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("gpt-4o", &config)],
        Arc::new(TextToolchain::new("Kogge-Stone")),
    )
    .with_critic(critic);

    let report = evaluation
        .run(&ids(&["prefix_or"]), CancellationToken::new())
        .await
        .unwrap();

    let entry = &report.entries[0];
    assert_eq!(entry.final_outcome, FinalOutcome::Passed);
    assert_eq!(entry.verdicts.len(), 2);

    let log_depth = entry.verdicts.iter().find(|v| v.requirement_id == "log_depth").unwrap();
    assert_eq!(log_depth.verdict, Verdict::Fail);
    let no_ripple = entry.verdicts.iter().find(|v| v.requirement_id == "no_ripple").unwrap();
    assert_eq!(no_ripple.verdict, Verdict::Uncertain);

    // One generation call, one critic call for log_depth, two for no_ripple.
    assert_eq!(entry.llm_calls.len(), 4);
    let critic_requests = critic_server.received_requests().await.unwrap();
    assert_eq!(critic_requests.len(), 3);
    for request in &critic_requests {
        let body = String::from_utf8_lossy(&request.body);
        assert!(body.contains("DSLX language reference (excerpt):"));
        assert!(body.contains("Immutable Array Updates"));
    }

    assert!(report.all_passed());
    assert!(!report.all_passed_strict());
    assert_eq!(report.run.critic_model.as_deref(), Some("gpt-4o-critic"));
}

#[tokio::test]
async fn test_rate_limit_is_retried_without_budget_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(RIGHT_POPCOUNT)))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.max_retries = 1;
    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("gpt-4o", &config)],
        Arc::new(TextToolchain::new("std::popcount")),
    );

    let report = evaluation
        .run(&ids(&["popcount"]), CancellationToken::new())
        .await
        .unwrap();

    let entry = &report.entries[0];
    assert_eq!(entry.final_outcome, FinalOutcome::Passed);
    assert_eq!(entry.attempts_consumed, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_fatal_error_is_isolated_per_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("\"model\":\"revoked\""))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(RIGHT_POPCOUNT)))
        .mount(&server)
        .await;

    let config = config(&server);
    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("revoked", &config), client("gpt-4o", &config)],
        Arc::new(TextToolchain::new("std::popcount")),
    );

    let report = evaluation
        .run(&ids(&["popcount"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.pair_count(), 2);
    let outcome = |model: &str| {
        report
            .entries
            .iter()
            .find(|e| e.model_id == model)
            .unwrap()
            .final_outcome
    };
    assert_eq!(outcome("revoked"), FinalOutcome::FatalApi);
    assert_eq!(outcome("gpt-4o"), FinalOutcome::Passed);
}

#[tokio::test]
async fn test_deadline_cancels_slow_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(RIGHT_POPCOUNT))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let config = config(&server);
    let evaluation = Evaluation::new(
        config.clone(),
        &tutorial(),
        repository(),
        vec![client("gpt-4o", &config)],
        Arc::new(TextToolchain::new("std::popcount")),
    );

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        deadline.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        evaluation.run(&ids(&["popcount", "prefix_or"]), cancel),
    )
    .await
    .expect("run did not stop after cancellation")
    .unwrap();

    assert_eq!(report.pair_count(), 2);
    assert!(report
        .entries
        .iter()
        .all(|e| e.final_outcome == FinalOutcome::Cancelled));
}
