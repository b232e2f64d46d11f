mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{AdminClient, NewLanguage};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctor CLI - Monitor and operate the execution queue", long_about = None)]
struct Cli {
    /// Base URL of the queue service
    #[arg(long, env = "PROCTOR_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show running jobs, queue depth, average wait and health
    Status,

    /// Show cumulative queue and security metrics
    Metrics {
        /// Print the raw JSON document
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Zero all cumulative metrics
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },

    /// Submit a source file for execution
    Submit {
        /// Language (python, java, cpp, javascript, rust)
        #[arg(short, long)]
        language: String,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// JSON file with an array of {input, expected_output, weight}
        #[arg(short, long)]
        tests: PathBuf,

        /// Priority class (high or normal)
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Per-test timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show the state or result of a job
    Job {
        /// Job ID
        id: String,
    },

    /// Register a language in config/languages.json
    AddLang {
        /// Language name (python, java, cpp, javascript, rust)
        #[arg(short, long)]
        name: String,

        /// Language version (e.g., 17, 3.12, 1.75)
        #[arg(short, long)]
        version: String,

        /// Docker image (defaults to proctor-{name}:{version}-v1)
        #[arg(short, long)]
        image: Option<String>,

        /// Source file name inside the container (e.g., Main.java)
        #[arg(long)]
        file_name: String,

        /// Compile command, for compiled languages
        #[arg(long)]
        compile: Option<String>,

        /// Run command; the test input arrives on stdin
        #[arg(long)]
        run: String,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "0.5")]
        cpu: f32,

        /// Per-test timeout in milliseconds
        #[arg(long, default_value = "5000")]
        test_timeout_ms: u64,

        /// Whole-job timeout in milliseconds
        #[arg(long, default_value = "60000")]
        job_timeout_ms: u64,

        /// Path of the languages file
        #[arg(long, default_value = "config/languages.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let client = AdminClient::new(&cli.url)?;
            commands::show_status(&client).await?;
        }
        Commands::Metrics { json } => {
            let client = AdminClient::new(&cli.url)?;
            commands::show_metrics(&client, json).await?;
        }
        Commands::Reset { yes } => {
            let client = AdminClient::new(&cli.url)?;
            commands::reset_metrics(&client, yes).await?;
        }
        Commands::Submit {
            language,
            file,
            tests,
            priority,
            timeout_ms,
        } => {
            let client = AdminClient::new(&cli.url)?;
            commands::submit_job(&client, &language, &file, &tests, &priority, timeout_ms).await?;
        }
        Commands::Job { id } => {
            let client = AdminClient::new(&cli.url)?;
            commands::show_job(&client, &id).await?;
        }
        Commands::AddLang {
            name,
            version,
            image,
            file_name,
            compile,
            run,
            memory,
            cpu,
            test_timeout_ms,
            job_timeout_ms,
            config,
        } => {
            commands::add_language(
                &config,
                NewLanguage {
                    name,
                    version,
                    image,
                    file_name,
                    compile,
                    run,
                    memory_limit_mb: memory,
                    cpu_limit: cpu,
                    test_timeout_ms,
                    job_timeout_ms,
                },
            )?;
        }
    }

    Ok(())
}
