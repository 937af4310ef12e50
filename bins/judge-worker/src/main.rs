mod status;

use anyhow::Context;
use judge_common::config::JudgeConfig;
use judge_common::types::{Job, JobResult};
use judge_engine::{JobHandle, JudgeEngine, JudgeError, JudgePool, LanguageRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// One line on stdout per submitted job
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Result(JobResult),
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        reason: String,
    },
}

impl Reply {
    fn rejected(job_id: Option<String>, error: &JudgeError) -> Self {
        Reply::Rejected {
            job_id,
            reason: error.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Judge worker booting...");

    let config = JudgeConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("Invalid judge configuration")?;

    // Load language configurations
    let registry = LanguageRegistry::load_or_builtin(config.languages_path.as_deref())
        .map_err(|e| {
            error!("Failed to load language configurations: {:#}", e);
            e
        })?;
    info!("Loaded language configurations for: {:?}", registry.list_languages());

    let engine = Arc::new(JudgeEngine::new(config.clone(), registry)?);
    engine
        .workspaces()
        .sweep_orphans()
        .await
        .context("Failed to sweep orphaned workspaces")?;

    info!(
        pool_size = config.pool_size,
        max_queue_depth = config.max_queue_depth,
        workspace_root = %config.workspace_root.display(),
        failure_policy = ?config.failure_policy,
        "Worker configured"
    );

    let pool = Arc::new(JudgePool::start(engine));

    if let Ok(addr) = std::env::var("JUDGE_STATUS_ADDR") {
        let state = status::StatusState {
            pool: Arc::clone(&pool),
            started_at: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = status::serve(&addr, state).await {
                error!("Status server stopped: {:#}", e);
            }
        });
    }

    let (replies, outbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(outbox));
    let mut pending = JoinSet::new();

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = intake_loop(BufReader::new(tokio::io::stdin()), &pool, &replies, &mut pending) => {
            result?;
            info!("Input closed, waiting for {} outstanding jobs", pending.len());
        }
        _ = shutdown => {
            warn!("Received shutdown signal, cancelling outstanding jobs...");
            pool.cancel_all();
        }
    }

    while pending.join_next().await.is_some() {}
    pool.shutdown().await;

    drop(replies);
    if let Err(e) = writer.await {
        error!("Result writer failed: {}", e);
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stdout carries results; logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read job descriptors, one JSON object per line, until the input closes.
/// Reply tasks are reaped as they finish so `pending` only holds live jobs.
#[instrument(skip_all)]
async fn intake_loop<R>(
    input: R,
    pool: &JudgePool,
    replies: &mpsc::UnboundedSender<Reply>,
    pending: &mut JoinSet<()>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            Some(joined) = pending.join_next(), if !pending.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Reply task failed");
                }
                continue;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match admit(pool, line) {
            Ok(handle) => {
                let replies = replies.clone();
                pending.spawn(async move {
                    let reply = await_result(handle).await;
                    let _ = replies.send(reply);
                });
            }
            Err(reply) => {
                let _ = replies.send(reply);
            }
        }
    }

    Ok(())
}

/// Parse and submit one line; the error side is the reply to send back
fn admit(pool: &JudgePool, line: &str) -> Result<JobHandle, Reply> {
    let job: Job = serde_json::from_str(line).map_err(|e| {
        warn!(error = %e, "Malformed job descriptor");
        Reply::Rejected {
            job_id: None,
            reason: format!("Malformed job descriptor: {}", e),
        }
    })?;

    info!(
        job_id = %job.id,
        language = %job.language,
        test_cases = job.test_cases.len(),
        source_size = job.source_code.len(),
        "Received job"
    );

    let job_id = job.id.clone();
    pool.submit(job).map_err(|e| {
        warn!(job_id = %job_id, error = %e, "Job rejected");
        Reply::rejected(Some(job_id), &e)
    })
}

async fn await_result(handle: JobHandle) -> Reply {
    let job_id = handle.id().to_string();
    match handle.result().await {
        Ok(result) => {
            info!(
                job_id = %result.job_id,
                verdict = %result.verdict,
                execution_ms = result.execution_time_ms,
                peak_memory_kb = result.peak_memory_kb,
                attempts = result.attempts,
                "Job finished"
            );
            Reply::Result(result)
        }
        Err(e) => {
            debug!(job_id = %job_id, error = %e, "Job ended without a result");
            Reply::rejected(Some(job_id), &e)
        }
    }
}

async fn write_replies(mut outbox: mpsc::UnboundedReceiver<Reply>) {
    let mut stdout = tokio::io::stdout();
    while let Some(reply) = outbox.recv().await {
        let line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize reply");
                continue;
            }
        };
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            error!(error = %e, "Failed to write reply to stdout");
            break;
        }
    }
}
