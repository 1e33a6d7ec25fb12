// =============================================================================
// Exit Guard — Paper Trading Entry Point
// =============================================================================
//
// Wires the exit engine to an in-memory store and the paper executor, then
// reads price ticks from stdin, one per line:
//
//   22540.5
//   22541,2025-11-03T09:15:02+08:00
//
// Paper exits fill immediately at their limit price. Ctrl-C or EOF stops the
// engine and flushes pending store writes.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use exit_guard::execution::PaperExecutor;
use exit_guard::order_tracker::FillReport;
use exit_guard::persistence::{PersistenceQueue, PersistenceWorker};
use exit_guard::store::{InMemoryStore, Position, StoreRow};
use exit_guard::{EngineConfig, ExitCoordinator};

const DEFAULT_CONFIG_PATH: &str = "exit_guard.json";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Exit Guard — Paper Mode                           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("EXIT_GUARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    if let Ok(product) = std::env::var("EXIT_GUARD_PRODUCT") {
        let product = product.trim().to_uppercase();
        if !product.is_empty() {
            config.product = product;
        }
    }
    info!(
        product = %config.product,
        activation_points = config.activation_points,
        pullback = config.trailing_pullback_ratio,
        lock_ttl_secs = config.exit_lock_ttl_secs,
        "Engine configured"
    );

    // ── 2. Store, executor, persistence ──────────────────────────────────
    let store = Arc::new(InMemoryStore::new());
    if let Ok(path) = std::env::var("EXIT_GUARD_POSITIONS") {
        let seeded = seed_positions(&store, &path)?;
        info!(path = %path, seeded, "Positions seeded");
    }

    let executor = Arc::new(PaperExecutor::new());
    let (queue, receiver) = PersistenceQueue::new();
    let worker = tokio::spawn(PersistenceWorker::new(receiver, store.clone()).run());

    // ── 3. Engine ────────────────────────────────────────────────────────
    let engine = Arc::new(ExitCoordinator::new(
        config,
        store.clone(),
        executor.clone(),
        queue,
    ));
    register_monitoring(&engine);

    let initial = {
        let e = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || e.reconcile())
            .await
            .context("initial reconciliation task aborted")??
    };
    info!(cached = initial.inserted, rejected = initial.rejected, "Position cache loaded");

    let background = engine.spawn_background_tasks();

    // ── 4. Price feed ────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received — shutting down");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Price feed closed — shutting down");
                break;
            }
            Err(e) => {
                error!(error = %e, "Price feed read failed — shutting down");
                break;
            }
        };

        let (price, ts) = match parse_tick(&line) {
            Ok(Some(tick)) => tick,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = %line, error = %e, "Unparseable tick skipped");
                continue;
            }
        };

        let report = engine.process_price_update(price, ts);
        if report.exits_submitted > 0 || report.error.is_some() {
            info!(
                price,
                exits = report.exits_submitted,
                denied = report.duplicates_denied,
                degraded = report.degraded,
                error = ?report.error,
                "Tick processed"
            );
        } else {
            debug!(price, evaluated = report.stats.positions_evaluated, "Tick processed");
        }

        fill_paper_orders(&engine, &executor, ts);
    }

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    for handle in background {
        handle.abort();
        let _ = handle.await;
    }
    match serde_json::to_string(&engine.stats()) {
        Ok(stats) => info!(stats = %stats, "Final engine stats"),
        Err(e) => warn!(error = %e, "Could not serialise engine stats"),
    }

    // Last queue handle goes with the engine; the worker then drains and stops.
    drop(engine);
    if let Err(e) = worker.await {
        error!(error = %e, "Persistence worker ended abnormally");
    }
    info!("Exit Guard stopped");
    Ok(())
}

/// `price[,rfc3339-timestamp]`. Blank lines and `#` comments yield `None`.
fn parse_tick(line: &str) -> Result<Option<(f64, DateTime<Utc>)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.splitn(2, ',');
    let price: f64 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .with_context(|| format!("invalid price in {line:?}"))?;
    let ts = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid timestamp {raw:?}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    Ok(Some((price, ts)))
}

/// Load a JSON array of position rows into the store. Bad rows are logged
/// and skipped.
fn seed_positions(store: &InMemoryStore, path: &str) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read positions file {path}"))?;
    let rows: Vec<StoreRow> = serde_json::from_str(&raw)
        .with_context(|| format!("positions file {path} is not a JSON array of objects"))?;

    let mut seeded = 0;
    for row in &rows {
        match Position::from_row(row) {
            Ok(position) => {
                store.insert_position(position);
                seeded += 1;
            }
            Err(e) => warn!(error = %e, "Seed row skipped"),
        }
    }
    Ok(seeded)
}

/// Paper orders fill at their limit as soon as they are submitted.
fn fill_paper_orders(engine: &ExitCoordinator, executor: &PaperExecutor, ts: DateTime<Utc>) {
    for order in executor.take_submitted() {
        let fill = FillReport {
            order_id: Some(order.order_id.clone()),
            product: order.request.product.clone(),
            fill_price: order.request.price,
            fill_qty: order.request.quantity,
            fill_time: ts,
        };
        if !engine.process_fill_report_at(&fill, ts) {
            warn!(order_id = %order.order_id, "Paper fill did not match a tracked exit order");
        }
    }
}

fn register_monitoring(engine: &ExitCoordinator) {
    let events = engine.events();
    events.on_fill(|ev| {
        info!(
            id = %ev.order.position_id,
            exit_type = %ev.order.exit_type,
            price = ev.fill_price,
            pnl = ev.pnl,
            "EXIT FILLED"
        );
        Ok(())
    });
    events.on_failed(|ev| {
        warn!(id = %ev.order.position_id, reason = %ev.reason, "EXIT FAILED — position still open");
        Ok(())
    });
    events.on_protection_update(|u| {
        info!(
            id = %u.position_id,
            old_stop = u.old_stop,
            new_stop = u.new_stop,
            cumulative = u.cumulative_profit,
            "STOP PROTECTED"
        );
        Ok(())
    });
}
