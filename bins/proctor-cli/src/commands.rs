// CLI commands for operating the Proctor queue
use anyhow::{bail, Context, Result};
use proctor_common::types::{Language, Priority, QueueMetrics, QueueStatus};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

/// Thin client over the queue's HTTP API
pub struct AdminClient {
    base_url: String,
    http: Client,
}

impl AdminClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.http
            .get(self.url("/admin/queue/status"))
            .send()
            .await
            .context("Failed to reach queue service")?
            .error_for_status()?
            .json()
            .await
            .context("Invalid status response")
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        self.http
            .get(self.url("/admin/queue/metrics"))
            .send()
            .await
            .context("Failed to reach queue service")?
            .error_for_status()?
            .json()
            .await
            .context("Invalid metrics response")
    }

    pub async fn reset(&self) -> Result<()> {
        let response = self
            .http
            .post(self.url("/admin/queue/metrics/reset"))
            .send()
            .await
            .context("Failed to reach queue service")?;

        if response.status() != StatusCode::NO_CONTENT {
            bail!("Reset failed with status {}", response.status());
        }
        Ok(())
    }

    /// Returns the status code and JSON body; non-2xx answers are not errors
    /// here since they carry the rejection reason.
    pub async fn submit(&self, body: &Value) -> Result<(StatusCode, Value)> {
        let response = self
            .http
            .post(self.url("/execute"))
            .json(body)
            .send()
            .await
            .context("Failed to reach queue service")?;

        let status = response.status();
        let body = response.json().await.context("Invalid submit response")?;
        Ok((status, body))
    }

    pub async fn job(&self, id: &str) -> Result<(StatusCode, Value)> {
        let response = self
            .http
            .get(self.url(&format!("/job/{}", id)))
            .send()
            .await
            .context("Failed to reach queue service")?;

        let status = response.status();
        let body = response.json().await.context("Invalid job response")?;
        Ok((status, body))
    }
}

pub fn format_status(status: &QueueStatus) -> String {
    let health = if status.healthy { "healthy" } else { "DEGRADED" };
    format!(
        "Running:      {}\nQueue depth:  {}\nAvg wait:     {} ms\nHealth:       {}",
        status.running, status.queue_depth, status.avg_wait_ms, health
    )
}

pub fn format_metrics(metrics: &QueueMetrics) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Jobs");
    let _ = writeln!(out, "  processed:        {}", metrics.total_jobs_processed);
    let _ = writeln!(out, "  started at once:  {}", metrics.total_jobs_immediate);
    let _ = writeln!(out, "  queued:           {}", metrics.total_jobs_queued);
    let _ = writeln!(out, "  high priority:    {}", metrics.high_priority_processed);
    let _ = writeln!(out, "  normal priority:  {}", metrics.normal_priority_processed);
    let _ = writeln!(out, "  max wait:         {} ms", metrics.max_wait_time_ms);
    let _ = writeln!(out, "  timeouts:         {}", metrics.total_timeouts);
    let _ = writeln!(out, "  errors:           {}", metrics.total_errors);

    if !metrics.running_by_language.is_empty() {
        let _ = writeln!(out, "Running by language");
        for (language, count) in &metrics.running_by_language {
            let _ = writeln!(out, "  {:<16}  {}", language, count);
        }
    }

    let security = &metrics.security;
    let _ = writeln!(out, "Security");
    let _ = writeln!(out, "  scans:            {}", security.total_scans);
    let _ = writeln!(out, "  rejections:       {}", security.total_rejections);
    let _ = writeln!(out, "  rejection rate:   {}", security.rejection_rate);

    // Newest first; five is what fits on an operator's screen
    for record in security.recent_violations.iter().take(5) {
        let _ = writeln!(
            out,
            "  {} [{}] {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.language,
            record.violations.join(", ")
        );
    }

    let last = metrics
        .last_job_processed_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(out, "Last job:           {}", last);
    let _ = write!(out, "Service started:    {}", metrics.service_started_at.to_rfc3339());

    out
}

/// Show queue status
pub async fn show_status(client: &AdminClient) -> Result<()> {
    let status = client.status().await?;
    println!("{}", format_status(&status));
    Ok(())
}

/// Show cumulative metrics
pub async fn show_metrics(client: &AdminClient, as_json: bool) -> Result<()> {
    let metrics = client
        .metrics()
        .await
        .context("Could not load queue metrics")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        println!("{}", format_metrics(&metrics));
    }
    Ok(())
}

/// Accepts y/yes in any case
pub fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn ask(prompt: &str, input: &mut impl BufRead) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(confirmed(&answer))
}

/// Reset cumulative metrics, after confirmation
pub async fn reset_metrics(client: &AdminClient, yes: bool) -> Result<()> {
    if !yes {
        let stdin = io::stdin();
        let proceed = ask(
            "This zeroes all counters and the violation log. Continue?",
            &mut stdin.lock(),
        )?;
        if !proceed {
            println!("Aborted");
            return Ok(());
        }
    }

    client.reset().await?;
    println!("✅ Metrics reset");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TestCaseFile {
    input: String,
    expected_output: String,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    10
}

/// Request body for POST /execute
pub fn build_submission(
    language: &str,
    source_code: &str,
    tests_json: &str,
    priority: &str,
    timeout_ms: Option<u64>,
) -> Result<Value> {
    let language: Language = language
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let priority = match priority.to_lowercase().as_str() {
        "high" => Priority::High,
        "normal" => Priority::Normal,
        other => bail!("Unknown priority '{}' (expected high or normal)", other),
    };

    let tests: Vec<TestCaseFile> =
        serde_json::from_str(tests_json).context("Failed to parse test cases file")?;
    if tests.is_empty() {
        bail!("Test cases file contains no test cases");
    }

    let test_cases: Vec<Value> = tests
        .into_iter()
        .map(|tc| {
            json!({
                "input": tc.input,
                "expected_output": tc.expected_output,
                "weight": tc.weight,
            })
        })
        .collect();

    let mut body = json!({
        "language": language,
        "priority": priority,
        "source_code": source_code,
        "test_cases": test_cases,
    });
    if let Some(ms) = timeout_ms {
        body["timeout_ms"] = json!(ms);
    }

    Ok(body)
}

/// Submit a source file with its test cases
pub async fn submit_job(
    client: &AdminClient,
    language: &str,
    file: &Path,
    tests: &Path,
    priority: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("Failed to read source file {}", file.display()))?;
    let tests_json = fs::read_to_string(tests)
        .with_context(|| format!("Failed to read test cases file {}", tests.display()))?;

    let body = build_submission(language, &source, &tests_json, priority, timeout_ms)?;
    let (status, response) = client.submit(&body).await?;

    match status {
        StatusCode::CREATED => {
            println!("✅ Job accepted");
            println!("   ID:    {}", response["jobId"].as_str().unwrap_or("?"));
            println!("   State: {}", response["state"].as_str().unwrap_or("?"));
            Ok(())
        }
        StatusCode::UNPROCESSABLE_ENTITY => {
            println!("⛔ Rejected by security scan:");
            if let Some(violations) = response["violations"].as_array() {
                for v in violations {
                    println!("   - {}", v.as_str().unwrap_or("?"));
                }
            }
            bail!("Submission rejected")
        }
        other => bail!(
            "Submission failed ({}): {}",
            other,
            response["error"].as_str().unwrap_or("unknown error")
        ),
    }
}

/// Show job state or result
pub async fn show_job(client: &AdminClient, id: &str) -> Result<()> {
    let (status, body) = client.job(id).await?;

    match status {
        StatusCode::OK => println!("{}", serde_json::to_string_pretty(&body)?),
        StatusCode::ACCEPTED => println!(
            "⏳ Job {} is {}",
            id,
            body["state"].as_str().unwrap_or("in flight")
        ),
        StatusCode::NOT_FOUND => bail!("Job {} not found", id),
        other => bail!(
            "Lookup failed ({}): {}",
            other,
            body["error"].as_str().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<String>,
    pub run: String,
}

/// One entry of languages.json; `security` is carried through untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageEntry {
    pub name: String,
    pub version: String,
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub test_timeout_ms: u64,
    pub job_timeout_ms: u64,
    pub execution: ExecutionEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageEntry>,
}

/// Arguments of `add-lang`
#[derive(Debug, Clone)]
pub struct NewLanguage {
    pub name: String,
    pub version: String,
    pub image: Option<String>,
    pub file_name: String,
    pub compile: Option<String>,
    pub run: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub test_timeout_ms: u64,
    pub job_timeout_ms: u64,
}

/// Load languages configuration
fn load_languages_config(config_path: &Path) -> Result<LanguagesJson> {
    if !config_path.exists() {
        return Ok(LanguagesJson { languages: vec![] });
    }

    let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
    serde_json::from_str(&content).context("Failed to parse languages.json")
}

/// Save languages configuration
fn save_languages_config(config_path: &Path, config: &LanguagesJson) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json_content =
        serde_json::to_string_pretty(config).context("Failed to serialize languages.json")?;
    fs::write(config_path, json_content + "\n").context("Failed to write languages.json")?;

    Ok(())
}

/// Register a language. The queue picks it up on its next start.
pub fn add_language(config_path: &Path, new: NewLanguage) -> Result<()> {
    println!("🚀 Adding language: {}", new.name);

    let language: Language = new.name.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    if new.version.is_empty() || new.file_name.is_empty() || new.run.is_empty() {
        bail!("Version, file name and run command cannot be empty");
    }
    if new.test_timeout_ms == 0 || new.job_timeout_ms < new.test_timeout_ms {
        bail!(
            "Invalid timeouts: test {}ms, job {}ms (job must cover at least one test)",
            new.test_timeout_ms,
            new.job_timeout_ms
        );
    }

    let mut languages_json = load_languages_config(config_path)?;

    if languages_json
        .languages
        .iter()
        .any(|l| l.name == language.as_str())
    {
        bail!("Language '{}' already exists in config", language);
    }

    let image = new
        .image
        .unwrap_or_else(|| format!("proctor-{}:{}-v1", language, new.version));

    languages_json.languages.push(LanguageEntry {
        name: language.as_str().to_string(),
        version: new.version,
        image: image.clone(),
        memory_limit_mb: new.memory_limit_mb,
        cpu_limit: new.cpu_limit,
        test_timeout_ms: new.test_timeout_ms,
        job_timeout_ms: new.job_timeout_ms,
        execution: ExecutionEntry {
            file_name: new.file_name,
            compile: new.compile,
            run: new.run,
        },
        security: None,
    });

    save_languages_config(config_path, &languages_json)?;

    println!("✅ Added {} to {}", language, config_path.display());
    println!("   Image: {}", image);
    println!("   Built-in security rules apply until a \"security\" block is added");
    println!("   Restart the queue service to enable it");

    Ok(())
}
