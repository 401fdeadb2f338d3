use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beanpoll::agent::Agent;
use beanpoll::client::JolokiaClient;
use beanpoll::config::{parse_servers, AgentConfig, DEFAULT_RUN_PERIOD};
use beanpoll::model::ProcessConfig;

#[derive(Parser)]
#[command(name = "beanpoll")]
#[command(
    about = "Polling agent that reads management metrics from remote managed processes and forwards samples to configured sinks"
)]
#[command(version)]
struct Cli {
    /// Configuration directory, or a single configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// Skip malformed configuration files instead of failing
    #[arg(long)]
    continue_on_error: bool,
    /// Default polling period in seconds for servers without their own
    #[arg(long, default_value_t = DEFAULT_RUN_PERIOD)]
    run_period: u64,
    /// Port for the /metrics endpoint (0 disables it)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
    /// Run once: schedule, wait a bounded grace interval, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // A panic in any task must end the process, not strand a dead worker.
    std::panic::set_hook(Box::new(|info| {
        error!("panic: {info}");
        std::process::exit(1);
    }));

    let mut config = AgentConfig::new(cli.config);
    config.continue_on_error = cli.continue_on_error;
    config.run_period_seconds = cli.run_period;
    config.metrics_port = cli.metrics_port;

    let agent = Agent::new(config, Arc::new(JolokiaClient::new()));

    if cli.once {
        let files = agent.config().process_config_files()?;
        let servers = parse_servers(&files, agent.config().continue_on_error)?;
        agent.run_standalone(ProcessConfig { servers }).await?;
        return Ok(());
    }

    agent.start().await?;

    tokio::select! {
        _ = shutdown_signal() => {
            agent.shutdown_hook().await;
        }
        _ = agent.wait_stopped() => {}
    }
    info!("beanpoll exited");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
