mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use judge_common::config::FailurePolicy;
use judge_engine::registry::DEFAULT_LANGUAGES_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "judge-cli")]
#[command(about = "Judge CLI - Run submissions locally and manage language profiles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge one or more job descriptor files
    Run {
        /// Job descriptor JSON files
        #[arg(required = true)]
        jobs: Vec<PathBuf>,

        /// Language config file (defaults to config/languages.json, then the built-in table)
        #[arg(short, long)]
        languages: Option<PathBuf>,

        /// Failure policy: short_circuit or run_all
        #[arg(short, long)]
        policy: Option<FailurePolicy>,

        /// Print full JSON results instead of a summary
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List configured languages
    Languages {
        /// Language config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Add a language profile
    AddLang {
        /// Language name (e.g., go, kotlin)
        #[arg(short, long)]
        name: String,

        /// File extension without the dot (e.g., go, kt)
        #[arg(short, long)]
        ext: String,

        /// Run command; {source}, {artifact} and {workdir} are substituted
        #[arg(short, long)]
        run: String,

        /// Compile command, omitted for interpreted languages
        #[arg(short, long)]
        compile: Option<String>,

        /// Source file name, {ext} expands to the extension
        #[arg(long, default_value = "main.{ext}")]
        source_file: String,

        /// Alternative ids that resolve to this language
        #[arg(short, long)]
        alias: Vec<String>,

        /// Language version (informational)
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u64,

        /// Run time limit per test in milliseconds
        #[arg(short, long, default_value = "2000")]
        time: u64,

        /// Compile time limit in milliseconds
        #[arg(long, default_value = "10000")]
        compile_time: u64,

        /// Apply an address-space limit (native binaries only)
        #[arg(long, default_value = "false")]
        limit_address_space: bool,

        /// Language config file
        #[arg(long, default_value = DEFAULT_LANGUAGES_PATH)]
        config: PathBuf,
    },

    /// Remove a language profile
    RemoveLang {
        /// Language name
        #[arg(short, long)]
        name: String,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,

        /// Language config file
        #[arg(long, default_value = DEFAULT_LANGUAGES_PATH)]
        config: PathBuf,
    },

    /// Remove workspace directories left behind by crashed runs
    Sweep {
        /// Workspace root (defaults to JUDGE_WORKSPACE_ROOT)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Progress goes to stdout; only warnings and errors are logged unless RUST_LOG says otherwise
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            jobs,
            languages,
            policy,
            json,
        } => {
            commands::run_jobs(&jobs, languages.as_deref(), policy, json).await?;
        }
        Commands::Languages { config } => {
            commands::list_languages(config.as_deref())?;
        }
        Commands::AddLang {
            name,
            ext,
            run,
            compile,
            source_file,
            alias,
            version,
            memory,
            time,
            compile_time,
            limit_address_space,
            config,
        } => {
            commands::add_language(
                &config,
                commands::NewLanguage {
                    name,
                    ext,
                    run,
                    compile,
                    source_file,
                    aliases: alias,
                    version,
                    memory_mb: memory,
                    time_ms: time,
                    compile_time_ms: compile_time,
                    limit_address_space,
                },
            )?;
        }
        Commands::RemoveLang { name, yes, config } => {
            commands::remove_language(&config, &name, yes)?;
        }
        Commands::Sweep { root } => {
            commands::sweep_workspaces(root).await?;
        }
    }

    Ok(())
}
