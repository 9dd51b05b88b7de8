//! Scripted doubles shared by unit tests.

#![allow(clippy::unwrap_used, missing_docs)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dslx_eval_toolchain::{
    OutcomeKind, RunRequest, Stage, StageRecord, Toolchain, ToolchainError, ToolchainResult,
};
use tokio_util::sync::CancellationToken;

use crate::error::{EvalError, LlmErrorKind, Result};
use crate::model::{Completion, ModelClient};
use crate::prompt::Conversation;

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(LlmErrorKind),
    Hang,
}

impl Reply {
    pub fn code(body: &str) -> Self {
        Self::Text(format!("```dslx\n{body}\n```"))
    }
}

/// Replies from a script; the last entry repeats once the rest are used.
pub struct ScriptedModel {
    id: String,
    script: Mutex<VecDeque<Reply>>,
    pub seen: Mutex<Vec<Conversation>>,
}

impl ScriptedModel {
    pub fn new(id: &str, script: Vec<Reply>) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn next(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, conversation: &Conversation) -> Result<Completion> {
        self.seen.lock().unwrap().push(conversation.clone());
        match self.next() {
            Reply::Text(text) => Ok(Completion {
                text,
                prompt_tokens: 10,
                completion_tokens: 5,
                duration_ms: 1,
            }),
            Reply::Error(kind) => Err(EvalError::llm_api_error(kind, "scripted failure")),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(EvalError::llm_api_error(LlmErrorKind::Timeout, "hung"))
            }
        }
    }
}

/// One scripted toolchain run.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Outcome(OutcomeKind),
    Unavailable,
    Hang,
}

/// Toolchain double; the last step repeats once the rest are used.
pub struct ScriptedToolchain {
    script: Mutex<VecDeque<Step>>,
    pub requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedToolchain {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(outcome: OutcomeKind) -> Self {
        Self::new(vec![Step::Outcome(outcome)])
    }

    pub fn runs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            *script.front().unwrap()
        }
    }
}

pub fn stage_record(stage: Stage, exit_code: Option<i32>, timed_out: bool, stderr: &str) -> StageRecord {
    StageRecord {
        stage,
        command: format!("{stage} module.x"),
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration_ms: 1,
        timed_out,
    }
}

pub fn result_for(outcome: OutcomeKind) -> ToolchainResult {
    let (typecheck, interpreter) = match outcome {
        OutcomeKind::Passed => (
            stage_record(Stage::Typecheck, Some(0), false, ""),
            Some(stage_record(Stage::Interpreter, Some(0), false, "")),
        ),
        OutcomeKind::TypeError => (
            stage_record(Stage::Typecheck, Some(1), false, "error: type mismatch"),
            None,
        ),
        OutcomeKind::RuntimeFailure => (
            stage_record(Stage::Typecheck, Some(0), false, ""),
            Some(stage_record(
                Stage::Interpreter,
                Some(1),
                false,
                "FAILED: assert_eq failed",
            )),
        ),
        OutcomeKind::Timeout => (
            stage_record(Stage::Typecheck, Some(0), false, ""),
            Some(stage_record(
                Stage::Interpreter,
                None,
                true,
                "interpreter timed out",
            )),
        ),
    };
    ToolchainResult::from_stages(typecheck, interpreter, Utc::now())
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ToolchainResult, ToolchainError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.next() {
            Step::Outcome(outcome) => Ok(result_for(outcome)),
            Step::Unavailable => Err(ToolchainError::spawn(
                "/missing/typecheck_main",
                std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            )),
            Step::Hang => {
                cancel.cancelled().await;
                Err(ToolchainError::Cancelled)
            }
        }
    }
}
