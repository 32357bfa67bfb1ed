use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_storage::{PgPool, models::*, repos};
use uuid::Uuid;

use super::{ReferralStore, StoreError};

/// [`ReferralStore`] backed by PostgreSQL.
///
/// Uniqueness (referral codes, one commission per referrer and payment) is
/// enforced by constraints and `ON CONFLICT DO NOTHING`, never by a prior read.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralStore for PgStore {
    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        repos::insert_account(&self.pool, account)
            .await?
            .ok_or_else(|| StoreError::CodeTaken(account.referral_code.clone()))
    }

    async fn account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(repos::get_account(&self.pool, id).await?)
    }

    async fn account_by_code(&self, code: &str) -> Result<Option<Account>, StoreError> {
        Ok(repos::get_account_by_code(&self.pool, code).await?)
    }

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(repos::referral_code_exists(&self.pool, code).await?)
    }

    async fn set_referred_by_if_unset(
        &self,
        account_id: Uuid,
        code: &str,
    ) -> Result<bool, StoreError> {
        Ok(repos::set_referred_by_if_unset(&self.pool, account_id, code).await?)
    }

    async fn record_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = match repos::get_payment_for_update(&mut *tx, payment.id).await? {
            Some(existing) => existing,
            None => match repos::insert_payment(&mut *tx, payment).await? {
                Some(inserted) => {
                    tx.commit().await?;
                    return Ok(inserted);
                }
                // Lost an insert race with a concurrent delivery; lock theirs.
                None => repos::get_payment_for_update(&mut *tx, payment.id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Unavailable(format!("payment {} vanished", payment.id))
                    })?,
            },
        };

        if existing.status == payment.status {
            tx.commit().await?;
            return Ok(existing);
        }
        if !existing.status.can_transition_to(payment.status) {
            return Err(StoreError::InvalidTransition {
                id: payment.id,
                from: existing.status.as_str(),
                to: payment.status.as_str(),
            });
        }

        let updated = repos::update_payment_status(&mut *tx, payment.id, payment.status).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn succeeded_payments_after(
        &self,
        after: (DateTime<Utc>, Uuid),
        limit: i64,
    ) -> Result<Vec<Payment>, StoreError> {
        Ok(repos::get_succeeded_payments_after(&self.pool, after, limit).await?)
    }

    async fn insert_commissions(
        &self,
        rows: &[NewReferralTransaction],
    ) -> Result<Vec<ReferralTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = repos::insert_referral_transactions_batch(&mut *tx, rows).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn referrer_transactions(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralTransaction>, StoreError> {
        Ok(repos::get_referrer_transactions(&self.pool, referrer_id).await?)
    }

    async fn count_referred(&self, code: &str) -> Result<i64, StoreError> {
        Ok(repos::count_referred(&self.pool, code).await?)
    }

    async fn count_active_referred(&self, code: &str) -> Result<i64, StoreError> {
        Ok(repos::count_active_referred(&self.pool, code).await?)
    }

    async fn mark_paid(&self, referrer_id: Uuid, ids: &[Uuid]) -> Result<u64, StoreError> {
        Ok(repos::mark_transactions_paid(&self.pool, referrer_id, ids).await?)
    }
}
