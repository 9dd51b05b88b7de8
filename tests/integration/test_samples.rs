//! Integration tests for the fixture sample set
//!
//! Loads the configuration, tutorial and samples under
//! `fixtures/dslx-eval` the way the CLI does and checks what the pipeline
//! would be given.

use std::path::PathBuf;

use dslx_eval_harness::config::{BackoffPolicy, RequirementPolicy};
use dslx_eval_harness::stub::stub_module;
use dslx_eval_harness::{prompt, Config, EvalError, SampleRepository, Tutorial};

/// Path to the fixture project.
fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/dslx-eval")
}

fn malformed_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/malformed")
}

#[test]
fn test_fixture_config_loads() {
    let config = Config::load_from_dir(&fixture_path()).expect("Failed to load config");

    assert_eq!(config.tutorial, "prompt.md");
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.concurrency, 2);
    assert_eq!(config.requirement_policy, RequirementPolicy::Advisory);
    assert_eq!(config.model.backoff.policy, BackoffPolicy::Fixed);
    assert_eq!(config.model.transient_retry_limit, 2);
    assert_eq!(config.critic.model.as_deref(), Some("gpt-4o"));
    assert_eq!(config.critic.json_retries, 1);
    assert_eq!(config.toolchain.interpreter_flags, ["--compare=jit"]);
    assert_eq!(config.feedback.max_chars, 2000);
    // Unset fields keep their defaults.
    assert_eq!(config.extractor.language_tags, ["dslx"]);
}

#[test]
fn test_fixture_tutorial_loads() {
    let tutorial = Tutorial::load(fixture_path().join("prompt.md")).expect("Failed to load tutorial");

    assert!(tutorial.content.contains("Immutable Array Updates"));
    assert!(tutorial.size_bytes < 100 * 1024);

    let preamble = tutorial.preamble();
    assert!(preamble.starts_with("# DSLX in Brief"));
    assert!(preamble.contains("```dslx"));
}

#[test]
fn test_fixture_samples_listed_in_order() {
    let repository = SampleRepository::new(fixture_path().join("samples"));

    let ids = repository.list().expect("Failed to list samples");

    assert_eq!(ids, ["popcount", "prefix_or"]);
}

#[test]
fn test_every_fixture_sample_parses() {
    let repository = SampleRepository::new(fixture_path().join("samples"));

    for id in repository.list().unwrap() {
        let sample = repository
            .load(&id)
            .unwrap_or_else(|e| panic!("sample {id} failed to load: {e}"));
        assert!(!sample.prompt.is_empty());
        assert!(!sample.signatures.is_empty());
        assert!(sample.tests.contains("#[test]"));
    }
}

#[test]
fn test_prefix_or_sample_details() {
    let repository = SampleRepository::new(fixture_path().join("samples"));
    let sample = repository.load("prefix_or").unwrap();

    assert_eq!(sample.signatures, ["fn prefix_or(x: u1[N]) -> u1[N]"]);
    assert_eq!(sample.prologue.as_deref(), Some("import std;\n\nconst N = u32:8;"));
    assert_eq!(sample.interpreter_flags, ["--max_ticks=1000"]);
    assert_eq!(sample.requirement_ids(), ["log_depth", "no_ripple"]);
    assert_eq!(
        sample.requirements[0].text,
        "The implementation must be a Kogge-Stone style prefix network with\nlog2(N) stages, each combining values from the previous stage."
    );
}

#[test]
fn test_problem_turn_never_leaks_tests() {
    let repository = SampleRepository::new(fixture_path().join("samples"));

    for id in repository.list().unwrap() {
        let sample = repository.load(&id).unwrap();
        let conversation = prompt::assemble("preamble", &sample);
        let problem = &conversation.turns()[1].text;

        assert!(problem.contains(&sample.signature));
        assert!(!problem.contains("#[test]"), "{id} problem shows tests");
    }
}

#[test]
fn test_stub_modules_for_fixtures() {
    let repository = SampleRepository::new(fixture_path().join("samples"));

    let popcount = stub_module(&repository.load("popcount").unwrap());
    assert!(popcount.as_str().starts_with("import std;\n\nfn popcount(x: u32) -> u32 {"));
    assert!(popcount.as_str().contains("zero!<u32>()"));

    let prefix_or = stub_module(&repository.load("prefix_or").unwrap());
    assert_eq!(prefix_or.as_str().matches("import std;").count(), 1);
    assert!(prefix_or.as_str().contains("zero!<u1[N]>()"));
    let stub_at = prefix_or.as_str().find("fn prefix_or").unwrap();
    let test_at = prefix_or.as_str().find("#[test]").unwrap();
    assert!(stub_at < test_at);
}

#[test]
fn test_malformed_fixtures_are_rejected() {
    let repository = SampleRepository::new(malformed_path());

    let missing_tests = repository.load("missing_tests").unwrap_err();
    assert!(matches!(missing_tests, EvalError::MalformedSample { .. }));
    assert!(missing_tests.to_string().contains("Tests"));

    let bad_requirement = repository.load("bad_requirement").unwrap_err();
    assert!(matches!(
        bad_requirement,
        EvalError::InvalidRequirementId { ref id, .. } if id == "not-an-identifier"
    ));
    assert!(bad_requirement.is_sample_error());
}

#[test]
fn test_unknown_sample_is_not_found() {
    let repository = SampleRepository::new(fixture_path().join("samples"));

    let err = repository.load("does_not_exist").unwrap_err();

    assert!(matches!(err, EvalError::SampleNotFound { .. }));
    assert!(err.to_string().contains("list-samples"));
}
