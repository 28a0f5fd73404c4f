//! Modbus TCP telemetry agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use sitelink_common::{SystemClock, init_tracing};
use sitelink_delivery::{AgentArgs, AgentConfig, AgentRunner, DeliveryQueue};
use sitelink_modbus::config::SiteConfig;
use sitelink_modbus::poller::DevicePoller;
use sitelink_modbus::scheduler::PollingScheduler;
use sitelink_modbus::transport::TcpTransport;

/// How long `--once` waits for the broker before polling anyway.
const ONCE_CONNECT_WAIT: Duration = Duration::from_secs(5);

/// Dead letters listed by `--inspect-queue`.
const INSPECT_LIMIT: u32 = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let args = AgentArgs::parse_with_default("sitelink.json5");

    let config = SiteConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.inspect_queue {
        return inspect_queue(&config).await;
    }

    let mut runner = AgentRunner::new_with_args("sitelink-modbus", config, Some(&args)).await?;

    let transport = TcpTransport::new((&runner.config().polling).into());
    let poller = DevicePoller::from_config(
        Box::new(transport),
        &runner.config().polling,
        runner.clock(),
    );
    let mut scheduler = PollingScheduler::new(
        runner.config(),
        poller,
        runner.gateway(),
        runner.queue(),
        runner.clock(),
    );

    let shutdown = runner.shutdown_token();

    if args.once {
        let gateway = runner.gateway();
        runner.spawn(async move {
            let mut state = gateway.watch_state();
            let waiting = state.wait_for(|s| s.is_connected());
            let connected = matches!(
                tokio::time::timeout(ONCE_CONNECT_WAIT, waiting).await,
                Ok(Ok(_))
            );
            if !connected {
                tracing::warn!("Broker not reachable, payload will be queued");
            }

            let outcome = scheduler.run_once().await;
            tracing::info!(?outcome, "Single cycle finished");
            shutdown.cancel();
        });
    } else {
        tracing::info!(
            site_id = runner.config().site_id,
            devices = runner.config().devices.len(),
            interval_secs = runner.config().poll_interval_secs,
            "Modbus agent running"
        );
        runner.spawn(async move {
            scheduler.run(shutdown).await;
        });
    }

    runner.run().await?;
    Ok(())
}

/// Print the delivery queue's counters and its oldest dead letters.
async fn inspect_queue(config: &SiteConfig) -> Result<()> {
    init_tracing(config.logging()).context("Failed to initialize logging")?;

    let queue = DeliveryQueue::open(config.store(), Arc::new(SystemClock))
        .await
        .context("Failed to open delivery queue")?;

    let stats = queue.stats().await?;
    println!("Queue: {}", config.store().resolved_path().display());
    println!("  pending:     {}", stats.pending);
    println!("  dead letter: {}", stats.dead_letter);

    let dead = queue.dead_letters(INSPECT_LIMIT).await?;
    if !dead.is_empty() {
        println!();
        println!("{:>8}  {:<24}  {:>7}  {}", "ID", "ENQUEUED", "RETRIES", "PAYLOAD TIME");
        for row in dead {
            let enqueued = row
                .enqueued_at()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let payload_time = row
                .payload()
                .map(|p| p.timestamp)
                .unwrap_or_else(|_| "<unreadable>".to_string());
            println!(
                "{:>8}  {:<24}  {:>7}  {}",
                row.id, enqueued, row.retries, payload_time
            );
        }
    }

    queue.close().await;
    Ok(())
}
