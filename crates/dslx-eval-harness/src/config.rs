//! Configuration types for the dslx-eval harness.
//!
//! Configuration is read from `dslx-eval.json`. Every field has a default, so
//! a missing file or an empty object yields a usable configuration. Command
//! line flags are applied on top by the CLI, after which [`Config::validate`]
//! runs again.
//!
//! Process environment is read once into an [`Environment`] snapshot; nothing
//! else in the harness touches `std::env`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dslx_eval_toolchain::ToolchainPaths;
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};

/// The default config file name.
pub const CONFIG_FILE_NAME: &str = "dslx-eval.json";

/// Default tutorial file path.
fn default_tutorial() -> String {
    "prompt.md".to_string()
}

/// Default directory holding sample documents.
fn default_samples_dir() -> String {
    "samples".to_string()
}

/// Default attempt budget per (sample, model) pair.
const fn default_max_retries() -> u32 {
    3
}

/// Default number of pairs evaluated at once.
const fn default_concurrency() -> usize {
    4
}

/// Default output directory for reports.
fn default_output_dir() -> String {
    ".".to_string()
}

/// Default chat completions endpoint.
fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

/// Default per-request model timeout in seconds.
const fn default_model_timeout() -> u64 {
    300
}

/// Default number of in-place retries for transient model errors.
const fn default_transient_retry_limit() -> u32 {
    3
}

/// Default backoff base in milliseconds.
const fn default_backoff_base_ms() -> u64 {
    1000
}

/// Default backoff ceiling in milliseconds.
const fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Models that reject requests without a reasoning effort.
fn default_reasoning_models() -> Vec<String> {
    ["o1", "o1-mini", "o3", "o3-mini", "o4-mini"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Default number of re-asks after a malformed critic response.
const fn default_json_retries() -> u32 {
    2
}

/// Default minimum confidence for a critic `pass`.
const fn default_min_confidence() -> f64 {
    0.5
}

/// Default per-subprocess timeout in seconds.
const fn default_toolchain_timeout() -> u64 {
    60
}

/// Default interpreter flags.
fn default_interpreter_flags() -> Vec<String> {
    vec!["--compare=jit".to_string()]
}

/// Default feedback length limit in characters.
const fn default_feedback_max_chars() -> usize {
    4000
}

/// Default fenced-block language tags.
fn default_language_tags() -> Vec<String> {
    vec!["dslx".to_string()]
}

/// Main configuration for an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the tutorial preamble.
    #[serde(default = "default_tutorial")]
    pub tutorial: String,

    /// Directory containing `*.md` sample documents.
    #[serde(default = "default_samples_dir")]
    pub samples_dir: String,

    /// Maximum number of attempts per (sample, model) pair.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of pairs evaluated concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Output directory for generated reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Directory for per-attempt artifacts. Nothing is written when unset.
    #[serde(default)]
    pub artifacts_dir: Option<String>,

    /// Wall-clock limit for the whole run in seconds.
    #[serde(default)]
    pub run_deadline_seconds: Option<u64>,

    /// Pause between a failed attempt and the next generation.
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// How critic verdicts affect the exit status.
    #[serde(default)]
    pub requirement_policy: RequirementPolicy,

    /// Generation model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Critic model settings.
    #[serde(default)]
    pub critic: CriticConfig,

    /// Toolchain invocation settings.
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Diagnostic feedback settings.
    #[serde(default)]
    pub feedback: FeedbackConfig,

    /// Code extraction settings.
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tutorial: default_tutorial(),
            samples_dir: default_samples_dir(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
            output_dir: default_output_dir(),
            artifacts_dir: None,
            run_deadline_seconds: None,
            retry_delay_ms: 0,
            requirement_policy: RequirementPolicy::default(),
            model: ModelConfig::default(),
            critic: CriticConfig::default(),
            toolchain: ToolchainConfig::default(),
            feedback: FeedbackConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or validated.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            EvalError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `dslx-eval.json` from a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or validated.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::ConfigParseError` if the file exists but contains
    /// invalid JSON or invalid enum values.
    ///
    /// Returns `EvalError::ConfigValidationError` if the values are invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(EvalError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| EvalError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(EvalError::config_validation(
                "maxRetries must be greater than 0",
                "Set maxRetries to at least 1 in your dslx-eval.json",
            ));
        }

        if self.concurrency == 0 {
            return Err(EvalError::config_validation(
                "concurrency must be greater than 0",
                "Set concurrency to at least 1 in your dslx-eval.json",
            ));
        }

        if self.run_deadline_seconds == Some(0) {
            return Err(EvalError::config_validation(
                "runDeadlineSeconds must be greater than 0",
                "Remove runDeadlineSeconds or set it to at least 1 second",
            ));
        }

        for (name, value) in [
            ("tutorial", &self.tutorial),
            ("samplesDir", &self.samples_dir),
            ("outputDir", &self.output_dir),
        ] {
            if value.trim().is_empty() {
                return Err(EvalError::config_validation(
                    format!("{name} must not be empty"),
                    format!("Provide a valid {name} path in your dslx-eval.json"),
                ));
            }
        }

        if self.model.endpoint.trim().is_empty() {
            return Err(EvalError::config_validation(
                "model.endpoint must not be empty",
                "Set model.endpoint to a chat completions URL",
            ));
        }

        if self.model.timeout_seconds == 0 {
            return Err(EvalError::config_validation(
                "model.timeoutSeconds must be greater than 0",
                "Set model.timeoutSeconds to at least 1 second in your dslx-eval.json",
            ));
        }

        if self.model.backoff.max_ms < self.model.backoff.base_ms {
            return Err(EvalError::config_validation(
                "model.backoff.maxMs must not be less than model.backoff.baseMs",
                "Raise model.backoff.maxMs or lower model.backoff.baseMs",
            ));
        }

        if !(0.0..=1.0).contains(&self.critic.min_confidence) {
            return Err(EvalError::config_validation(
                format!(
                    "critic.minConfidence must be between 0 and 1, got {}",
                    self.critic.min_confidence
                ),
                "Set critic.minConfidence to a value such as 0.5",
            ));
        }

        if self.toolchain.timeout_seconds == 0 {
            return Err(EvalError::config_validation(
                "toolchain.timeoutSeconds must be greater than 0",
                "Set toolchain.timeoutSeconds to at least 1 second in your dslx-eval.json",
            ));
        }

        if self.feedback.max_chars == 0 {
            return Err(EvalError::config_validation(
                "feedback.maxChars must be greater than 0",
                "Set feedback.maxChars to a value such as 4000",
            ));
        }

        if self
            .extractor
            .language_tags
            .iter()
            .all(|tag| tag.trim().is_empty())
        {
            return Err(EvalError::config_validation(
                "extractor.languageTags must contain at least one tag",
                "Set extractor.languageTags to [\"dslx\"]",
            ));
        }

        Ok(())
    }

    /// Checks that every reasoning model in `models` has a reasoning effort.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::ConfigValidationError` naming the first offending model.
    pub fn validate_models<'a>(&self, models: impl IntoIterator<Item = &'a str>) -> Result<()> {
        if self.model.reasoning_effort.is_some() {
            return Ok(());
        }
        for model in models {
            if self.model.is_reasoning_model(model) {
                return Err(EvalError::config_validation(
                    format!("model '{model}' requires a reasoning effort"),
                    "Pass --reasoning-effort or set model.reasoningEffort in your dslx-eval.json",
                ));
            }
        }
        Ok(())
    }

    /// Returns the per-subprocess time limit.
    #[must_use]
    pub const fn toolchain_timeout(&self) -> Duration {
        Duration::from_secs(self.toolchain.timeout_seconds)
    }

    /// Returns the pause between attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// How critic verdicts count towards the overall result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequirementPolicy {
    /// Verdicts are reported but do not change the exit status (default).
    #[default]
    Advisory,
    /// Every requirement must be judged `pass` for the run to succeed.
    Strict,
}

impl RequirementPolicy {
    /// Parses a string into a `RequirementPolicy`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "advisory" => Some(Self::Advisory),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RequirementPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid requirement policy '{s}': expected one of 'advisory', 'strict'"
            ))
        })
    }
}

impl Serialize for RequirementPolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            Self::Advisory => "advisory",
            Self::Strict => "strict",
        })
    }
}

/// Reasoning effort sent with requests to reasoning models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    /// Low effort.
    Low,
    /// Medium effort.
    Medium,
    /// High effort.
    High,
}

impl ReasoningEffort {
    /// Parses a string into a `ReasoningEffort`, case-insensitively.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl<'de> Deserialize<'de> for ReasoningEffort {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid reasoning effort '{s}': expected one of 'low', 'medium', 'high'"
            ))
        })
    }
}

impl Serialize for ReasoningEffort {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Generation model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Chat completions URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,

    /// In-place retries for transient errors before giving up on a pair.
    #[serde(default = "default_transient_retry_limit")]
    pub transient_retry_limit: u32,

    /// Delay schedule between transient retries.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Reasoning effort sent with every request when set.
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,

    /// Send the preamble as a user turn instead of a system turn.
    #[serde(default)]
    pub preamble_as_user: bool,

    /// Model ids that require a reasoning effort.
    #[serde(default = "default_reasoning_models")]
    pub reasoning_models: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_seconds: default_model_timeout(),
            transient_retry_limit: default_transient_retry_limit(),
            backoff: BackoffConfig::default(),
            reasoning_effort: None,
            preamble_as_user: false,
            reasoning_models: default_reasoning_models(),
        }
    }
}

impl ModelConfig {
    /// Returns `true` if `model` is listed as a reasoning model.
    #[must_use]
    pub fn is_reasoning_model(&self, model: &str) -> bool {
        self.reasoning_models.iter().any(|m| m == model)
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Shape of the delay schedule between transient retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// The same delay every time.
    Fixed,
    /// Doubling delay, capped at the maximum (default).
    #[default]
    Exponential,
}

impl BackoffPolicy {
    /// Parses a string into a `BackoffPolicy`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for BackoffPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid backoff policy '{s}': expected one of 'fixed', 'exponential'"
            ))
        })
    }
}

impl Serialize for BackoffPolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        })
    }
}

/// Delay schedule between transient model retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Schedule shape.
    #[serde(default)]
    pub policy: BackoffPolicy,

    /// First delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    /// Upper bound for any delay in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

impl BackoffConfig {
    /// Returns the delay before transient retry number `retry` (1-based).
    ///
    /// Exponential delays are `base * 2^(retry - 1)`, capped at `max_ms`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ms = match self.policy {
            BackoffPolicy::Fixed => self.base_ms,
            BackoffPolicy::Exponential => {
                let exponent = retry.saturating_sub(1).min(32);
                self.base_ms.saturating_mul(1_u64 << exponent)
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }
}

/// Critic model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticConfig {
    /// Critic model id. Requirements are not judged when unset.
    #[serde(default)]
    pub model: Option<String>,

    /// Re-asks after a malformed response before recording `uncertain`.
    #[serde(default = "default_json_retries")]
    pub json_retries: u32,

    /// A `pass` below this confidence is recorded as `uncertain`.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            model: None,
            json_retries: default_json_retries(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Toolchain invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolchainConfig {
    /// Time limit for each subprocess in seconds.
    #[serde(default = "default_toolchain_timeout")]
    pub timeout_seconds: u64,

    /// Flags passed to the type checker.
    #[serde(default)]
    pub typecheck_flags: Vec<String>,

    /// Flags passed to the interpreter before any sample-declared flags.
    #[serde(default = "default_interpreter_flags")]
    pub interpreter_flags: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_toolchain_timeout(),
            typecheck_flags: Vec::new(),
            interpreter_flags: default_interpreter_flags(),
        }
    }
}

/// Diagnostic feedback settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackConfig {
    /// Longest diagnostic text sent back to the model, in characters.
    #[serde(default = "default_feedback_max_chars")]
    pub max_chars: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_chars: default_feedback_max_chars(),
        }
    }
}

/// Code extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorConfig {
    /// Fenced-block info-string tags treated as candidate code.
    #[serde(default = "default_language_tags")]
    pub language_tags: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            language_tags: default_language_tags(),
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Name of the model credential variable.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
/// Name of the tools directory variable.
pub const TOOLS_VAR: &str = "XLSYNTH_TOOLS";
/// Name of the standard library override variable.
pub const STDLIB_VAR: &str = "DSLX_STDLIB_PATH";

/// Snapshot of the process environment taken once at start-up.
#[derive(Clone, Default)]
pub struct Environment {
    /// Model API credential.
    pub api_key: Option<String>,
    /// Directory containing the toolchain binaries.
    pub tools_dir: Option<PathBuf>,
    /// Standard library override.
    pub stdlib_path: Option<PathBuf>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("tools_dir", &self.tools_dir)
            .field("stdlib_path", &self.stdlib_path)
            .finish()
    }
}

impl Environment {
    /// Reads the relevant variables from the process environment.
    #[must_use]
    pub fn capture() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a snapshot from an arbitrary lookup function.
    ///
    /// Empty values are treated as unset.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            api_key: get(API_KEY_VAR),
            tools_dir: get(TOOLS_VAR).map(PathBuf::from),
            stdlib_path: get(STDLIB_VAR).map(PathBuf::from),
        }
    }

    /// Returns the model credential.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::MissingEnvironment` if it was not set.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or(EvalError::MissingEnvironment {
                name: API_KEY_VAR,
                suggestion: "Export OPENAI_API_KEY with your model API key",
            })
    }

    /// Resolves toolchain binary and stdlib locations.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::MissingEnvironment` if the tools directory was not set.
    pub fn toolchain_paths(&self) -> Result<ToolchainPaths> {
        let tools_dir = self
            .tools_dir
            .as_deref()
            .ok_or(EvalError::MissingEnvironment {
                name: TOOLS_VAR,
                suggestion: "Export XLSYNTH_TOOLS pointing at the installed xlsynth tools directory",
            })?;
        Ok(ToolchainPaths::from_tools_dir(
            tools_dir,
            self.stdlib_path.clone(),
        ))
    }
}
