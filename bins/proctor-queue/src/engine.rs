/// Sandbox Engine - Running Untrusted Code in Docker
///
/// Turns a job's source and test inputs into raw per-test outputs.
///
/// **Boundaries:**
/// - Judging correctness belongs to the evaluator
/// - The whole-job wall-clock limit belongs to the executor, which drops
///   the `run` future on expiry; the container guard goes with it and the
///   container is force-removed

use crate::config::LanguageConfig;
use crate::evaluator::{CompilationResult, TestExecutionOutput};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use proctor_common::types::{JobRequest, TestCase};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Limits applied before anything reaches Docker
const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Working directory inside the container, relative to `/`
const WORKDIR: &str = "code";

fn input_file(test_id: u32) -> String {
    format!("input-{test_id}.txt")
}

fn append_file(archive: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    archive
        .append_data(&mut header, path, contents)
        .with_context(|| format!("Failed to add {} to archive", path))
}

/// Tar archive to unpack at `/`: the source file plus one stdin file per
/// test case. Oversized inputs are left out; `run_test` reports them.
fn workspace_archive(job: &JobRequest, language: &LanguageConfig) -> Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    // World-writable so compilers can drop artifacts next to the source
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o777);
    dir.set_size(0);
    archive
        .append_data(&mut dir, format!("{WORKDIR}/"), std::io::empty())
        .context("Failed to add work directory to archive")?;

    append_file(
        &mut archive,
        &format!("{WORKDIR}/{}", language.execution.file_name),
        job.source_code.as_bytes(),
    )?;

    for test_case in &job.test_cases {
        if test_case.input.len() > MAX_TEST_INPUT_BYTES {
            continue;
        }
        append_file(
            &mut archive,
            &format!("{WORKDIR}/{}", input_file(test_case.id)),
            test_case.input.as_bytes(),
        )?;
    }

    archive.into_inner().context("Failed to finish archive")
}

/// A runtime able to execute one job's source against its test cases
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run every test case of `job`, each limited to `test_timeout`.
    ///
    /// Returns one output per executed test case. An `Err` means the
    /// sandbox itself failed, not the submitted program.
    async fn run(
        &self,
        job: &JobRequest,
        language: &LanguageConfig,
        test_timeout: Duration,
    ) -> Result<Vec<TestExecutionOutput>>;
}

/// Container cleanup guard - guarantees container removal on drop,
/// including when the execution future is aborted on timeout
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        // Drop cannot be async; hand removal to the runtime if there is one
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime available to remove container");
            return;
        };

        handle.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Docker-based sandbox
///
/// **Docker Execution Rules:**
/// 1. One container per job, created from the language image
/// 2. Network disabled, memory and CPU limits from the language config
/// 3. Source and test inputs uploaded once as a tar archive, compiled once
///    (when the language compiles)
/// 4. Each test case runs as an exec with its own timeout
/// 5. Container force-removed when the job ends, however it ends
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Pull the image when it is not cached locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn start_container(
        &self,
        job: &JobRequest,
        language: &LanguageConfig,
        keep_alive: Duration,
    ) -> Result<ContainerGuard> {
        let container_name = format!("proctor-{}", job.id);

        let config = Config {
            image: Some(language.image.clone()),
            // Keep the container alive; work happens through execs
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("sleep {}", keep_alive.as_secs().max(1)),
            ]),
            entrypoint: Some(vec![]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(i64::from(language.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(language.cpu_limit) * 1_000_000_000.0) as i64),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            working_dir: Some("/code".to_string()),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        // Guard first, so a failed start still removes the container
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id,
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        Ok(guard)
    }

    /// Run a shell command in the container, collecting stdout, stderr and
    /// the exit code
    async fn exec(&self, container_id: &str, command: String) -> Result<(String, String, Option<i64>)> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["bash".to_string(), "-c".to_string(), command]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .context("Failed to create exec")?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        stderr.push_str(&format!("\n[Execution error: {}]", e));
                        break;
                    }
                }
            }
        } else {
            bail!("Failed to attach to exec");
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok((stdout, stderr, inspect.exit_code))
    }

    /// Copy source and test inputs in through the archive endpoint, which
    /// has no command-line length limit
    async fn upload_workspace(
        &self,
        container_id: &str,
        job: &JobRequest,
        language: &LanguageConfig,
    ) -> Result<()> {
        let archive = workspace_archive(job, language)?;
        debug!(archive_bytes = archive.len(), "Uploading workspace");

        let options = UploadToContainerOptions {
            path: "/",
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .context("Failed to upload source and inputs to container")
    }

    async fn compile(&self, container_id: &str, language: &LanguageConfig) -> Result<CompilationResult> {
        let Some(compile_cmd) = language.execution.compile.as_deref() else {
            return Ok(CompilationResult::success());
        };

        let start = Instant::now();
        let (stdout, stderr, code) = self
            .exec(container_id, format!("{} 2>&1", compile_cmd))
            .await?;
        let compilation_time_ms = start.elapsed().as_millis() as u64;

        if code == Some(0) {
            info!(compilation_time_ms, language = %language.name, "Compilation succeeded");
            Ok(CompilationResult::success())
        } else {
            // 2>&1 folds compiler diagnostics into stdout
            let diagnostics = if stderr.is_empty() { stdout } else { stderr };
            warn!(
                compilation_time_ms,
                language = %language.name,
                error_preview = diagnostics.lines().next().unwrap_or(""),
                "Compilation failed"
            );
            Ok(CompilationResult::failure(diagnostics))
        }
    }

    async fn run_test(
        &self,
        container_id: &str,
        language: &LanguageConfig,
        test_case: &TestCase,
        timeout: Duration,
    ) -> TestExecutionOutput {
        let start = Instant::now();

        if test_case.input.len() > MAX_TEST_INPUT_BYTES {
            return TestExecutionOutput {
                test_id: test_case.id,
                stderr: format!("Test input exceeds {} bytes", MAX_TEST_INPUT_BYTES),
                runtime_error: true,
                ..Default::default()
            };
        }

        // Subshell so JVM banner noise does not leak into stderr
        let command = format!(
            "(unset JAVA_TOOL_OPTIONS; {}) < /{}/{}",
            language.execution.run,
            WORKDIR,
            input_file(test_case.id)
        );

        let mut output = TestExecutionOutput {
            test_id: test_case.id,
            ..Default::default()
        };

        match tokio::time::timeout(timeout, self.exec(container_id, command)).await {
            Ok(Ok((stdout, stderr, code))) => {
                output.stdout = stdout;
                output.stderr = stderr;
                match code {
                    Some(0) => {}
                    Some(137) => {
                        output.runtime_error = true;
                        output
                            .stderr
                            .push_str("\n[Killed: likely exceeded memory limit]");
                    }
                    Some(139) => {
                        output.runtime_error = true;
                        output.stderr.push_str("\n[Killed: segmentation fault]");
                    }
                    Some(_) => output.runtime_error = true,
                    None => warn!(test_id = test_case.id, "No exit code captured"),
                }
            }
            Ok(Err(e)) => {
                output.runtime_error = true;
                output.stderr = format!("Execution failed: {}", e);
            }
            Err(_) => {
                output.timed_out = true;
                output.stderr = "[Execution timed out]".to_string();
            }
        }

        output.execution_time_ms = start.elapsed().as_millis() as u64;
        output
    }
}

fn compilation_error_outputs(test_cases: &[TestCase], message: &str) -> Vec<TestExecutionOutput> {
    test_cases
        .iter()
        .map(|tc| TestExecutionOutput {
            test_id: tc.id,
            stderr: message.to_string(),
            compilation_failed: true,
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl Sandbox for DockerEngine {
    #[tracing::instrument(
        skip(self, job, language),
        fields(job_id = %job.id, language = %job.language, test_count = job.test_cases.len())
    )]
    async fn run(
        &self,
        job: &JobRequest,
        language: &LanguageConfig,
        test_timeout: Duration,
    ) -> Result<Vec<TestExecutionOutput>> {
        let job_start = Instant::now();

        self.ensure_image(&language.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}'", language.image))?;

        // Outlive the job limit slightly; the guard removes it earlier anyway
        let keep_alive = Duration::from_millis(language.job_timeout_ms) + Duration::from_secs(5);
        let container = self.start_container(job, language, keep_alive).await?;

        self.upload_workspace(&container.container_id, job, language)
            .await?;

        let compilation = self.compile(&container.container_id, language).await?;
        if !compilation.success {
            return Ok(compilation_error_outputs(&job.test_cases, &compilation.stderr));
        }

        let mut outputs = Vec::with_capacity(job.test_cases.len());
        for test_case in &job.test_cases {
            let output = self
                .run_test(&container.container_id, language, test_case, test_timeout)
                .await;

            debug!(
                test_id = output.test_id,
                execution_time_ms = output.execution_time_ms,
                timed_out = output.timed_out,
                runtime_error = output.runtime_error,
                "Test executed"
            );
            outputs.push(output);
        }

        info!(
            total_execution_time_ms = job_start.elapsed().as_millis() as u64,
            tests_executed = outputs.len(),
            tests_clean = outputs.iter().filter(|o| !o.runtime_error && !o.timed_out).count(),
            "Job executed in container"
        );

        drop(container);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_common::types::{Language, Priority};
    use std::collections::HashMap;
    use std::io::Read;
    use uuid::Uuid;

    fn unpack(archive: &[u8]) -> HashMap<String, (u32, String)> {
        let mut reader = tar::Archive::new(archive);
        let mut entries = HashMap::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let mode = entry.header().mode().unwrap();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            entries.insert(path, (mode, contents));
        }
        entries
    }

    #[test]
    fn test_workspace_archive_layout() {
        let language = LanguageConfig::builtin(Language::Python);
        // Far past the 128 KiB a single exec argument may carry
        let big_input = "9 ".repeat(200_000);
        let job = JobRequest {
            id: Uuid::new_v4(),
            language: Language::Python,
            priority: Priority::Normal,
            source_code: "print(sum(map(int, input().split())))\n".to_string(),
            test_cases: vec![
                TestCase {
                    id: 1,
                    input: big_input.clone(),
                    expected_output: "1800000".to_string(),
                    weight: 1,
                },
                TestCase {
                    id: 7,
                    input: "it's \"quoted\" $HOME".to_string(),
                    expected_output: String::new(),
                    weight: 1,
                },
                TestCase {
                    id: 8,
                    input: "x".repeat(MAX_TEST_INPUT_BYTES + 1),
                    expected_output: String::new(),
                    weight: 1,
                },
            ],
            timeout_ms: None,
        };

        let entries = unpack(&workspace_archive(&job, &language).unwrap());

        assert_eq!(entries.len(), 4);
        assert_eq!(entries["code"].0, 0o777);
        let source = &entries[&format!("code/{}", language.execution.file_name)];
        assert_eq!(source.0, 0o644);
        assert_eq!(source.1, job.source_code);
        assert_eq!(entries["code/input-1.txt"].1, big_input);
        assert_eq!(entries["code/input-7.txt"].1, "it's \"quoted\" $HOME");
        assert!(!entries.contains_key("code/input-8.txt"));
    }

    #[test]
    fn test_compilation_error_outputs_cover_every_test() {
        let cases = vec![
            TestCase {
                id: 1,
                input: String::new(),
                expected_output: "a".to_string(),
                weight: 1,
            },
            TestCase {
                id: 2,
                input: String::new(),
                expected_output: "b".to_string(),
                weight: 1,
            },
        ];
        let outputs = compilation_error_outputs(&cases, "error: expected ';'");
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.compilation_failed));
        assert_eq!(outputs[1].test_id, 2);
        assert_eq!(outputs[0].stderr, "error: expected ';'");
    }

    /// Requires a Docker daemon and the proctor-python image
    #[tokio::test]
    #[ignore]
    async fn test_docker_python_success() {
        let engine = DockerEngine::new().expect("Failed to connect to Docker");
        let language = LanguageConfig::builtin(Language::Python);
        let job = JobRequest {
            id: Uuid::new_v4(),
            language: Language::Python,
            priority: Priority::Normal,
            source_code: "n = int(input())\nprint(n * 2)\n".to_string(),
            test_cases: vec![TestCase {
                id: 1,
                input: "5".to_string(),
                expected_output: "10".to_string(),
                weight: 10,
            }],
            timeout_ms: None,
        };

        let outputs = engine
            .run(&job, &language, Duration::from_secs(5))
            .await
            .expect("sandbox failed");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].stdout.trim(), "10");
    }

    /// Requires a Docker daemon and the proctor-java image
    #[tokio::test]
    #[ignore]
    async fn test_docker_java_compilation_error() {
        let engine = DockerEngine::new().expect("Failed to connect to Docker");
        let language = LanguageConfig::builtin(Language::Java);
        let job = JobRequest {
            id: Uuid::new_v4(),
            language: Language::Java,
            priority: Priority::Normal,
            source_code: "public class Main { public static void main(String[] a) { System.out.println(\"x\") } }".to_string(),
            test_cases: vec![TestCase {
                id: 1,
                input: String::new(),
                expected_output: "x".to_string(),
                weight: 10,
            }],
            timeout_ms: None,
        };

        let outputs = engine
            .run(&job, &language, Duration::from_secs(5))
            .await
            .expect("sandbox failed");
        assert!(outputs.iter().all(|o| o.compilation_failed));
    }
}
