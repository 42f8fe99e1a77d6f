use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use stockguard_core::{IdempotencyKey, Quantity, Sku};
use stockguard_infra::config::{ENV_MAX_ATTEMPTS, ENV_STRATEGY};
use stockguard_infra::{
    DeductionService, InMemoryStockStore, PostgresStockStore, StockConfig, StockStore,
    StrategyKind,
};
use stockguard_inventory::{DeductionOutcome, DeductionRequest};
use stockguard_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "stockguard-drill")]
#[command(about = "Fire concurrent deductions at one SKU and check that nothing oversold")]
struct Cli {
    /// Deduction strategy (overrides STOCK_DEDUCTION_STRATEGY)
    #[arg(long)]
    strategy: Option<StrategyKind>,
    #[arg(long, default_value = "DRILL-1")]
    sku: Sku,
    /// Units each request deducts
    #[arg(long, default_value_t = 1)]
    quantity: i64,
    /// Number of concurrent requests
    #[arg(long, default_value_t = 100)]
    requests: usize,
    /// Run against an in-memory store instead of DATABASE_URL
    #[arg(long)]
    in_memory: bool,
    /// Starting stock. Seeds the in-memory row; with Postgres it upserts the
    /// row first, otherwise the existing row is used as-is.
    #[arg(long)]
    initial: Option<i64>,
    /// Total attempts per request (overrides STOCK_RETRY_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Give every request its own idempotency key
    #[arg(long)]
    idempotent: bool,
    #[arg(long, default_value = "json")]
    log_format: LogFormat,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct Tally {
    successes: usize,
    replayed: usize,
    declined: usize,
    exhausted: usize,
    not_found: usize,
    errors: usize,
}

impl Tally {
    fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a DeductionOutcome>) -> Self {
        let mut tally = Tally::default();
        for outcome in outcomes {
            match outcome {
                DeductionOutcome::Success { replayed: false, .. } => tally.successes += 1,
                DeductionOutcome::Success { replayed: true, .. } => tally.replayed += 1,
                DeductionOutcome::InsufficientStock { .. } => tally.declined += 1,
                DeductionOutcome::ConflictRetryExhausted { .. } => tally.exhausted += 1,
                DeductionOutcome::NotFound => tally.not_found += 1,
                DeductionOutcome::StoreError { .. } => tally.errors += 1,
            }
        }
        tally
    }
}

#[derive(Debug, Serialize)]
struct DrillReport {
    strategy: StrategyKind,
    sku: Sku,
    quantity_each: i64,
    requests: usize,
    initial_quantity: i64,
    final_quantity: i64,
    granted: i64,
    #[serde(flatten)]
    tally: Tally,
    elapsed_ms: u64,
    invariant_held: bool,
}

impl DrillReport {
    fn new(
        strategy: StrategyKind,
        request: &DeductionRequest,
        initial_quantity: i64,
        final_quantity: i64,
        outcomes: &[DeductionOutcome],
        elapsed: Duration,
    ) -> Self {
        let tally = Tally::from_outcomes(outcomes);
        let granted = tally.successes as i64 * request.quantity.get();
        let invariant_held = final_quantity >= 0
            && granted <= initial_quantity
            && final_quantity == initial_quantity - granted;

        Self {
            strategy,
            sku: request.sku.clone(),
            quantity_each: request.quantity.get(),
            requests: outcomes.len(),
            initial_quantity,
            final_quantity,
            granted,
            tally,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            invariant_held,
        }
    }
}

fn load_config(cli: &Cli) -> Result<StockConfig> {
    let strategy = cli.strategy.map(|s| s.as_str().to_string());
    let max_attempts = cli.max_attempts.map(|n| n.to_string());

    StockConfig::from_lookup(|key| match key {
        k if k == ENV_STRATEGY && strategy.is_some() => strategy.clone(),
        k if k == ENV_MAX_ATTEMPTS && max_attempts.is_some() => max_attempts.clone(),
        k => std::env::var(k).ok(),
    })
    .context("invalid deduction configuration (pass --strategy or set STOCK_DEDUCTION_STRATEGY)")
}

async fn run<S>(
    store: S,
    config: &StockConfig,
    template: &DeductionRequest,
    requests: usize,
    idempotent: bool,
) -> Result<DrillReport>
where
    S: StockStore + Clone + 'static,
{
    let initial = store
        .current_quantity(&template.sku)
        .await?
        .ok_or_else(|| anyhow!("no stock row for {}", template.sku))?;
    let service = DeductionService::from_config(store.clone(), config);

    info!(
        strategy = %config.strategy,
        sku = %template.sku,
        initial,
        requests,
        "starting drill"
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..requests)
        .map(|_| {
            let service = service.clone();
            let mut request = template.clone();
            if idempotent {
                request = request.with_idempotency_key(IdempotencyKey::new());
            }
            tokio::spawn(async move { service.deduct(request).await })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(requests);
    for handle in handles {
        outcomes.push(handle.await.context("deduction task failed")?);
    }
    let elapsed = started.elapsed();

    let final_quantity = store
        .current_quantity(&template.sku)
        .await?
        .ok_or_else(|| anyhow!("stock row for {} disappeared", template.sku))?;

    Ok(DrillReport::new(
        config.strategy,
        template,
        initial,
        final_quantity,
        &outcomes,
        elapsed,
    ))
}

async fn postgres_store(config: &StockConfig, cli: &Cli) -> Result<PostgresStockStore> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set (or pass --in-memory)")?;
    let options = PostgresStockStore::connect_options(&database_url, config.lock_timeout)?;
    let max_connections = u32::try_from(cli.requests.clamp(1, 64)).unwrap_or(64);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("failed to connect to postgres")?;

    if let Some(initial) = cli.initial {
        sqlx::query(
            "INSERT INTO stock (sku, quantity) VALUES ($1, $2)
             ON CONFLICT (sku) DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = NOW()",
        )
        .bind(cli.sku.as_str())
        .bind(initial)
        .execute(&pool)
        .await
        .context("failed to seed stock row")?;
    }

    Ok(PostgresStockStore::new(pool, config.lock_timeout))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    stockguard_observability::init_with(cli.log_format);

    let config = load_config(&cli)?;
    let template = DeductionRequest::new(cli.sku.clone(), Quantity::new(cli.quantity)?);

    let report = if cli.in_memory {
        let store = InMemoryStockStore::new(config.lock_timeout);
        store.put(cli.sku.clone(), cli.initial.unwrap_or(100)).await?;
        run(store, &config, &template, cli.requests, cli.idempotent).await?
    } else {
        let store = postgres_store(&config, &cli).await?;
        run(store, &config, &template, cli.requests, cli.idempotent).await?
    };

    if report.invariant_held {
        info!(
            granted = report.granted,
            final_quantity = report.final_quantity,
            elapsed_ms = report.elapsed_ms,
            "drill finished"
        );
    } else {
        warn!(
            granted = report.granted,
            initial = report.initial_quantity,
            final_quantity = report.final_quantity,
            "stock accounting does not add up"
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.invariant_held {
        bail!("oversell check failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(units: i64) -> DeductionRequest {
        DeductionRequest::parse("DRILL-1", units).unwrap()
    }

    #[test]
    fn tally_counts_every_outcome_kind() {
        let outcomes = vec![
            DeductionOutcome::Success {
                new_quantity: 1,
                replayed: false,
            },
            DeductionOutcome::Success {
                new_quantity: 1,
                replayed: true,
            },
            DeductionOutcome::InsufficientStock {
                available: 1,
                requested: 2,
            },
            DeductionOutcome::ConflictRetryExhausted { attempts: 5 },
            DeductionOutcome::NotFound,
            DeductionOutcome::StoreError {
                message: "boom".into(),
            },
        ];

        let tally = Tally::from_outcomes(&outcomes);
        assert_eq!(
            tally,
            Tally {
                successes: 1,
                replayed: 1,
                declined: 1,
                exhausted: 1,
                not_found: 1,
                errors: 1,
            }
        );
    }

    #[test]
    fn report_flags_unaccounted_stock() {
        let outcomes = vec![
            DeductionOutcome::Success {
                new_quantity: 3,
                replayed: false,
            };
            2
        ];

        let ok = DrillReport::new(
            StrategyKind::PessimisticLock,
            &request(2),
            7,
            3,
            &outcomes,
            Duration::ZERO,
        );
        assert!(ok.invariant_held);
        assert_eq!(ok.granted, 4);

        let lost_update = DrillReport::new(
            StrategyKind::PessimisticLock,
            &request(2),
            7,
            5,
            &outcomes,
            Duration::ZERO,
        );
        assert!(!lost_update.invariant_held);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let cli = Cli::parse_from([
            "stockguard-drill",
            "--strategy",
            "conditional",
            "--max-attempts",
            "3",
            "--in-memory",
        ]);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.strategy, StrategyKind::ConditionalUpdate);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
