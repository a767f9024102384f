//! Docker code sandbox.
//!
//! One container per run: the source and stdin travel base64-encoded in the
//! environment, a small shell script writes the file, optionally compiles
//! it and pipes stdin into the run command.
//!
//! Guarantees:
//! - network disabled, memory and CPU capped
//! - hard timeout enforced with `tokio::time::timeout`, container killed on expiry
//! - container removed on every exit path via a drop guard, including cancellation
//! - OOM kills detected through container inspection, exit code 137 as fallback
//! - images are pulled in the background, never inside a timed run; a run
//!   whose image is missing reports the sandbox as unavailable

use super::{check_request_size, CodeSandbox, RunOutput, RunRequest, SandboxError};
use crate::languages::{LanguageConfig, LanguageRegistry};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Exit status the run script uses when the compile step fails.
const COMPILE_FAILED_EXIT: i64 = 86;
const OOM_EXIT: i64 = 137;
const SEGFAULT_EXIT: i64 = 139;

/// Removes the container when dropped. Drop cannot be async, so removal is
/// spawned onto the runtime.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
    languages: Arc<LanguageRegistry>,
    pulling: Arc<Mutex<HashSet<String>>>,
}

impl DockerSandbox {
    /// Connect to the local daemon, check that it answers and start pulling
    /// every registered language image in the background.
    pub async fn connect(languages: Arc<LanguageRegistry>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(format!("failed to connect to Docker: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Docker daemon not responding: {e}")))?;
        let sandbox = Self {
            docker,
            languages,
            pulling: Arc::new(Mutex::new(HashSet::new())),
        };

        let images: BTreeSet<String> = sandbox
            .languages
            .list_languages()
            .iter()
            .filter_map(|name| sandbox.languages.resolve(name))
            .map(|lang| lang.image.clone())
            .collect();
        for image in images {
            if sandbox.docker.inspect_image(&image).await.is_err() {
                sandbox.spawn_pull(image);
            }
        }
        Ok(sandbox)
    }

    /// Pull `image` on a background task unless a pull is already running.
    fn spawn_pull(&self, image: String) {
        {
            let mut pulling = self.pulling.lock().unwrap_or_else(|e| e.into_inner());
            if !pulling.insert(image.clone()) {
                return;
            }
        }
        let sandbox = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sandbox.pull_image(&image).await {
                warn!(image = %image, error = %e, "Image pull failed");
            }
            sandbox
                .pulling
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&image);
        });
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Unavailable(format!("failed to pull {image}: {e}")))?;
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Succeeds only when the image is already local; otherwise a pull is
    /// started and the run is reported as unavailable.
    async fn require_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }
        self.spawn_pull(image.to_string());
        Err(SandboxError::Unavailable(format!("image {image} is not available yet")))
    }

    async fn was_oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Container inspection failed");
                false
            }
        }
    }
}

/// Shell script run as the container command.
fn run_script(lang: &LanguageConfig) -> String {
    let file = lang.execution.source_path();
    let mut lines = vec![format!(
        "printf '%s' \"$SOURCE_CODE\" | base64 -d > {file} || exit 1"
    )];
    if let Some(compile) = &lang.execution.compile {
        lines.push(format!(
            "{} || exit {}",
            compile.replace("{file}", &file),
            COMPILE_FAILED_EXIT
        ));
    }
    lines.push(format!(
        "printf '%s' \"$TEST_INPUT\" | base64 -d | {}",
        lang.execution.run.replace("{file}", &file)
    ));
    lines.join("\n")
}

/// Memory cap in bytes: the language limit, tightened by the test's limit.
fn memory_limit_bytes(lang: &LanguageConfig, requested_mb: u32) -> i64 {
    let mb = if requested_mb == 0 {
        lang.memory_limit_mb
    } else {
        lang.memory_limit_mb.min(requested_mb)
    };
    (mb as i64) * 1024 * 1024
}

fn classify(exit_code: Option<i64>, oom_killed: bool, output: &mut RunOutput) {
    if oom_killed {
        output.memory_exceeded = true;
        output.stderr.push_str("\n[Container killed: exceeded memory limit]");
        return;
    }
    match exit_code {
        Some(0) | None => {}
        Some(COMPILE_FAILED_EXIT) => output.compilation_failed = true,
        Some(OOM_EXIT) => {
            output.memory_exceeded = true;
            output.stderr.push_str("\n[Container killed: likely OOM]");
        }
        Some(code) => {
            output.runtime_error = true;
            if code == SEGFAULT_EXIT {
                output.stderr.push_str("\n[Container killed: segmentation fault]");
            }
        }
    }
}

#[async_trait]
impl CodeSandbox for DockerSandbox {
    #[instrument(skip(self, request), fields(language = %request.language, timeout_ms = request.timeout.as_millis() as u64))]
    async fn run(&self, request: RunRequest) -> Result<RunOutput, SandboxError> {
        check_request_size(&request)?;
        let lang = self
            .languages
            .resolve(&request.language)
            .ok_or_else(|| SandboxError::Rejected(format!("unsupported language: {}", request.language)))?;

        self.require_image(&lang.image).await?;

        let env = vec![
            format!("SOURCE_CODE={}", general_purpose::STANDARD.encode(&request.source)),
            format!("TEST_INPUT={}", general_purpose::STANDARD.encode(&request.stdin)),
            format!("LANGUAGE={}", lang.name),
        ];

        let config = Config {
            image: Some(lang.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), run_script(lang)]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(memory_limit_bytes(lang, request.memory_limit_mb)),
                nano_cpus: Some((lang.cpu_limit as f64 * 1_000_000_000.0) as i64),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("assessor-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to create container: {e}")))?;
        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to start container: {e}")))?;

        let execution = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to read container exit code");
                    None
                }
                None => None,
            };
            (stdout, stderr, exit_code)
        };

        let mut output = match tokio::time::timeout(request.timeout, execution).await {
            Ok((stdout, stderr, exit_code)) => {
                let mut output = RunOutput {
                    stdout,
                    stderr,
                    exit_code,
                    ..Default::default()
                };
                let oom = match exit_code {
                    Some(0) => false,
                    _ => self.was_oom_killed(&container_id).await,
                };
                classify(exit_code, oom, &mut output);
                output
            }
            Err(_) => {
                warn!(timeout_ms = request.timeout.as_millis() as u64, "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                RunOutput {
                    stderr: "[Execution timed out]".to_string(),
                    timed_out: true,
                    ..Default::default()
                }
            }
        };
        output.execution_time_ms = start_time.elapsed().as_millis() as u64;

        debug!(
            exit_code = ?output.exit_code,
            execution_ms = output.execution_time_ms,
            timed_out = output.timed_out,
            memory_exceeded = output.memory_exceeded,
            "Container run finished"
        );
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
