//! Execution backends. Sandboxes know how to run things, never whether the
//! result is correct; judging is left to the evaluators.

mod docker;
mod sql;

pub use docker::DockerSandbox;
pub use sql::{QueryResult, SqlFailure, SqlJob, SqlSandbox};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Upper bounds checked before anything reaches a backend.
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub language: String,
    pub source: String,
    pub stdin: String,
    pub timeout: Duration,
    pub memory_limit_mb: u32,
}

/// Raw output of one run; classification flags are mutually exclusive in
/// practice but reported as observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub runtime_error: bool,
    pub compilation_failed: bool,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// Backend unreachable or failed for reasons unrelated to the artifact.
    /// Retried by the dispatcher.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    /// The run itself was refused (oversized input, unknown language).
    #[error("sandbox rejected run: {0}")]
    Rejected(String),
}

impl SandboxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_))
    }
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<RunOutput, SandboxError>;

    fn name(&self) -> &'static str;
}

pub(crate) fn check_request_size(request: &RunRequest) -> Result<(), SandboxError> {
    if request.source.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::Rejected(format!(
            "source code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if request.stdin.len() > MAX_STDIN_BYTES {
        return Err(SandboxError::Rejected(format!(
            "test input exceeds maximum size of {} bytes",
            MAX_STDIN_BYTES
        )));
    }
    Ok(())
}

/// Stand-in used when code execution is switched off or Docker is
/// unreachable. Every run fails transiently.
#[derive(Debug, Clone)]
pub struct UnavailableSandbox {
    reason: String,
}

impl UnavailableSandbox {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CodeSandbox for UnavailableSandbox {
    async fn run(&self, _request: RunRequest) -> Result<RunOutput, SandboxError> {
        Err(SandboxError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedSandbox;

#[cfg(any(test, feature = "testing"))]
mod scripted {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Script = dyn Fn(&RunRequest) -> Result<RunOutput, SandboxError> + Send + Sync;

    /// In-process sandbox driven by a closure.
    #[derive(Clone)]
    pub struct ScriptedSandbox {
        script: Arc<Script>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ScriptedSandbox {
        pub fn new<F>(script: F) -> Self
        where
            F: Fn(&RunRequest) -> Result<RunOutput, SandboxError> + Send + Sync + 'static,
        {
            Self {
                script: Arc::new(script),
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }

        /// Echo stdin back as stdout; the source is ignored.
        pub fn echo() -> Self {
            Self::new(|req| {
                Ok(RunOutput {
                    stdout: req.stdin.clone(),
                    exit_code: Some(0),
                    ..Default::default()
                })
            })
        }

        /// Print whatever the source says after `print `, or inside
        /// `print("...")`, one line per statement. Enough to fake a tiny
        /// interpreter in tests.
        pub fn printer() -> Self {
            Self::new(|req| {
                let stdout: String = req
                    .source
                    .lines()
                    .map(str::trim)
                    .filter_map(|line| {
                        line.strip_prefix("print(\"")
                            .and_then(|rest| rest.strip_suffix("\")"))
                            .or_else(|| line.strip_prefix("print "))
                    })
                    .map(|text| format!("{text}\n"))
                    .collect();
                Ok(RunOutput {
                    stdout,
                    exit_code: Some(0),
                    ..Default::default()
                })
            })
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodeSandbox for ScriptedSandbox {
        async fn run(&self, request: RunRequest) -> Result<RunOutput, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            check_request_size(&request)?;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(&request)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }
}
