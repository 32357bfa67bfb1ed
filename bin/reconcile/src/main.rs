//! Commission Reconciler — replays succeeded payments through the commission
//! calculator so that commissions lost to dropped webhooks get recorded.
//!
//! Flow:
//! 1. Connect to PostgreSQL and apply migrations
//! 2. Page through succeeded payments oldest first
//! 3. Re-run the calculator on each; existing commissions are skipped by the
//!    (referrer_id, payment_id) constraint
//!
//! Safe to run concurrently with the API server and to interrupt with Ctrl-C;
//! the next run starts over and skips everything already recorded.

use std::sync::Arc;

use eyre::Result;
use ledger_core::{Settings, telemetry};
use ledger_referral::{Backfill, CommissionCalculator, PgStore, ReferralStore, policy};
use ledger_storage as storage;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Initialisation ──────────────────────────────────────────────────
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!(batch_size = settings.batch_size, "Starting commission reconciler");

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let store: Arc<dyn ReferralStore> = Arc::new(PgStore::new(pool));
    let calculator = Arc::new(CommissionCalculator::new(
        store.clone(),
        policy::from_settings(&settings.commission),
    ));
    let mut backfill = Backfill::new(store, calculator, settings.batch_size);

    // ── Replay Loop ─────────────────────────────────────────────────────
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Interrupted, stopping early…");
                break;
            }
            result = backfill.process_next_page() => {
                match result {
                    Ok(true) => failures = 0,
                    Ok(false) => break,
                    Err(e) if e.is_retryable() && failures < 5 => {
                        failures += 1;
                        tracing::error!(error = %e, attempt = failures, "Reconcile error, retrying in 5s…");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    let totals = backfill.totals();
    tracing::info!(
        payments = totals.payments,
        recovered = totals.commissions,
        "Reconciler stopped."
    );
    Ok(())
}
