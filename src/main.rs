use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use closebot::execution::OrderIntent;
use closebot::{Bar, ExecutionEngine, Settings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const HEALTH_INTERVAL_SECS: u64 = 60;

/// Bar close execution engine. Reads newline-delimited JSON bars on stdin.
#[derive(Debug, Parser)]
#[command(name = "closebot", version)]
struct Args {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log_filter.as_deref());

    tracing::info!("🚀 closebot starting");

    let settings = Settings::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to load settings")?;

    tracing::info!("📊 Configuration:");
    tracing::info!("  Timezone: {} (daily close {})", settings.schedule.timezone, settings.schedule.daily_close);
    tracing::info!("  Min bars: {}", settings.engine.min_bars_for_execution);
    tracing::info!("  Functions: {}", settings.functions.len());
    for monitor in &settings.monitors {
        tracing::info!("    - {} {}", monitor.symbol, monitor.timeframe);
    }

    let (engine, orders) = ExecutionEngine::new(settings)
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to build execution engine")?;
    let engine = Arc::new(engine);
    engine.start();

    let order_task = tokio::spawn(order_loop(orders));
    let health_task = {
        let engine = engine.clone();
        tokio::spawn(async move { health_loop(engine).await })
    };
    let feed_task = {
        let engine = engine.clone();
        tokio::spawn(async move { tick_feed_loop(engine).await })
    };

    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = feed_task => {
            tracing::warn!("Tick feed ended: {:?}", result);
        }
        result = order_task => {
            tracing::error!("Order loop exited: {:?}", result);
        }
    }

    health_task.abort();
    engine.shutdown();
    match serde_json::to_string(&engine.health()) {
        Ok(health) => tracing::info!(health = %health, "Final health"),
        Err(e) => tracing::warn!("Failed to serialize health: {}", e),
    }

    tracing::info!("👋 closebot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("closebot=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Feed bars from stdin until it closes
async fn tick_feed_loop(engine: Arc<ExecutionEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0u64;
    let mut malformed = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read tick feed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let bar: Bar = match serde_json::from_str(&line) {
            Ok(bar) => bar,
            Err(e) => {
                malformed += 1;
                tracing::warn!("Malformed bar line: {}", e);
                continue;
            }
        };
        // Rejections are logged by the adapter
        if engine.on_tick(bar).is_ok() {
            accepted += 1;
        }
    }

    tracing::info!(accepted, malformed, "Tick feed closed");
}

/// Stand-in for the broker side: log every order intent
async fn order_loop(mut orders: mpsc::Receiver<OrderIntent>) {
    while let Some(intent) = orders.recv().await {
        match &intent {
            OrderIntent::Submit(order) => tracing::info!(
                symbol = %order.symbol,
                side = ?order.side,
                stop_loss = ?order.stop_loss,
                take_profit = ?order.take_profit,
                risk = ?order.risk_category,
                function = %order.function_name,
                "📈 Order intent"
            ),
            OrderIntent::ModifyStop(modification) => tracing::info!(
                symbol = %modification.symbol,
                new_stop = modification.new_stop,
                function = %modification.function_name,
                "🛡️ Stop modification intent"
            ),
        }
    }
    tracing::info!("Order queue closed");
}

async fn health_loop(engine: Arc<ExecutionEngine>) {
    let mut ticker = interval(Duration::from_secs(HEALTH_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let health = engine.health();
        tracing::info!(
            monitored = health.monitored.len(),
            avg_timing_ms = health.timing.avg_ms,
            max_timing_ms = health.timing.max_ms,
            checks = health.checks_emitted,
            skipped = health.checks_skipped,
            audit_entries = health.audit.entries_in_memory,
            audit_degraded = health.audit.degraded,
            signals = health.emitter.signals_emitted,
            "💓 Health"
        );
    }
}
