//! Datastore seam for the referral engine.
//!
//! Every engine component is constructed with an `Arc<dyn ReferralStore>`;
//! production wires [`PgStore`], tests wire [`MemoryStore`].

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::AppError;
use ledger_storage::models::*;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("referral code `{0}` is already taken")]
    CodeTaken(String),

    #[error("payment {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidTransition { from, to, .. } => AppError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            other => AppError::Database(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ReferralStore: Send + Sync {
    /// Insert an account; `CodeTaken` when its referral code is in use.
    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError>;

    async fn account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn account_by_code(&self, code: &str) -> Result<Option<Account>, StoreError>;

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Set `referred_by` unless already set. Returns whether it changed.
    async fn set_referred_by_if_unset(
        &self,
        account_id: Uuid,
        code: &str,
    ) -> Result<bool, StoreError>;

    /// Insert or advance a payment, enforcing [`PaymentStatus::can_transition_to`].
    async fn record_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError>;

    /// Succeeded payments after the `(created_at, id)` cursor, oldest first.
    async fn succeeded_payments_after(
        &self,
        after: (DateTime<Utc>, Uuid),
        limit: i64,
    ) -> Result<Vec<Payment>, StoreError>;

    /// Atomically insert every row whose (referrer_id, payment_id) is new.
    /// Either all new rows are written or none; returns those written.
    async fn insert_commissions(
        &self,
        rows: &[NewReferralTransaction],
    ) -> Result<Vec<ReferralTransaction>, StoreError>;

    async fn referrer_transactions(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralTransaction>, StoreError>;

    async fn count_referred(&self, code: &str) -> Result<i64, StoreError>;

    async fn count_active_referred(&self, code: &str) -> Result<i64, StoreError>;

    /// Flip `paid` on unpaid rows owned by `referrer_id`. Returns rows changed.
    async fn mark_paid(&self, referrer_id: Uuid, ids: &[Uuid]) -> Result<u64, StoreError>;
}
