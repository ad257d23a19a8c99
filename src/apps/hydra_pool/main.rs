//! Hydra Pool main entry point
//! Hydra Pool 主入口点

use anyhow::{Context, Result};
use clap::Parser;
use hydra_pool::config::{init_tracing, AppConfig, CliArgs, HydraConfig};
use hydra_pool::pool::{CommandBackend, ParallelTask, PoolManager, TaskOptions};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = HydraConfig::load_with_overrides(args.config.as_deref(), &args.overrides())?;

    init_tracing(&config.logging.to_logging_config())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(args, config))
}

async fn read_stdin_prompts() -> Result<Vec<String>> {
    let mut prompts = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if !line.is_empty() {
            prompts.push(line.to_string());
        }
    }
    Ok(prompts)
}

async fn run(args: CliArgs, config: HydraConfig) -> Result<()> {
    tracing::info!("Hydra Pool starting with:");
    tracing::info!("  - Backend: {}", config.backend.program);
    tracing::info!(
        "  - Instances: {}..={}",
        config.pool.min_instances,
        config.pool.max_instances
    );
    tracing::info!("  - Strategy: {:?}", config.pool.strategy);

    let mut prompts = args.prompts.clone();
    if args.stdin {
        prompts.extend(read_stdin_prompts().await?);
    }

    let backend = Arc::new(CommandBackend::new(config.backend.clone()));
    let pool = PoolManager::new(config.pool.clone(), backend)?;
    pool.initialize().await.context("Failed to initialize pool")?;

    let tasks: Vec<ParallelTask> = prompts
        .into_iter()
        .map(|prompt| {
            let options = match &args.agent {
                Some(agent) => TaskOptions::default().with_agent(agent.clone()),
                None => TaskOptions::default(),
            };
            ParallelTask::new(prompt).with_options(options)
        })
        .collect();

    let run_pool = pool.clone();
    let work = async move {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let pool = run_pool.clone();
                tokio::spawn(async move { pool.execute_task(&task.prompt, task.options).await })
            })
            .collect();
        for handle in handles {
            match handle.await {
                Ok(Ok(result)) => println!("{}", serde_json::to_string(&result)?),
                Ok(Err(e)) => tracing::error!(error = %e, "Task rejected"),
                Err(e) => tracing::error!(error = %e, "Task panicked"),
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = work => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, draining pool");
            pool.start_drain();
        }
    }

    println!("{}", serde_json::to_string_pretty(&pool.get_full_status_json()?)?);

    pool.shutdown().await?;
    tracing::info!("Hydra Pool shutdown complete");
    Ok(())
}
