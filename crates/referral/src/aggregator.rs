use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use ledger_core::AppError;
use ledger_storage::models::{Account, ReferralTransaction};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::store::ReferralStore;

/// Referral dashboard figures for one referrer. Unknown referrers get
/// [`ReferralStats::default`], all zeros.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferralStats {
    /// Accounts linked to the code, paying or not.
    pub total_referrals: i64,
    /// Linked accounts with at least one succeeded payment.
    pub active_referrals: i64,
    pub total_earnings: Decimal,
    /// Earnings since the start of the current UTC calendar month.
    pub monthly_earnings: Decimal,
    pub paid_earnings: Decimal,
    pub pending_earnings: Decimal,
}

/// First instant of `now`'s calendar month, in UTC.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Read-side summaries over the referral ledger. Nothing is cached; every
/// call recomputes from the store.
pub struct LedgerAggregator {
    store: Arc<dyn ReferralStore>,
}

impl LedgerAggregator {
    pub fn new(store: Arc<dyn ReferralStore>) -> Self {
        Self { store }
    }

    pub async fn get_referral_stats(&self, referral_code: &str) -> Result<ReferralStats, AppError> {
        self.get_referral_stats_at(referral_code, Utc::now()).await
    }

    pub async fn get_referral_stats_at(
        &self,
        referral_code: &str,
        now: DateTime<Utc>,
    ) -> Result<ReferralStats, AppError> {
        let code = referral_code.trim();
        if code.is_empty() {
            return Ok(ReferralStats::default());
        }
        match self.store.account_by_code(code).await? {
            Some(referrer) => self.stats_for(&referrer, now).await,
            None => Ok(ReferralStats::default()),
        }
    }

    pub async fn get_referral_stats_by_id(
        &self,
        account_id: Uuid,
    ) -> Result<ReferralStats, AppError> {
        self.get_referral_stats_by_id_at(account_id, Utc::now()).await
    }

    pub async fn get_referral_stats_by_id_at(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReferralStats, AppError> {
        match self.store.account(account_id).await? {
            Some(referrer) => self.stats_for(&referrer, now).await,
            None => Ok(ReferralStats::default()),
        }
    }

    /// Ledger rows owed to a referrer, newest first.
    pub async fn commissions(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralTransaction>, AppError> {
        Ok(self.store.referrer_transactions(referrer_id).await?)
    }

    async fn stats_for(
        &self,
        referrer: &Account,
        now: DateTime<Utc>,
    ) -> Result<ReferralStats, AppError> {
        let total_referrals = self.store.count_referred(&referrer.referral_code).await?;
        let active_referrals = self
            .store
            .count_active_referred(&referrer.referral_code)
            .await?;
        let rows = self.store.referrer_transactions(referrer.id).await?;

        let mut stats = summarize(&rows, month_start(now));
        stats.total_referrals = total_referrals;
        stats.active_referrals = active_referrals;
        Ok(stats)
    }
}

/// Fold ledger rows into earnings figures; referral counts are left at zero.
fn summarize(rows: &[ReferralTransaction], month_start: DateTime<Utc>) -> ReferralStats {
    rows.iter().fold(ReferralStats::default(), |mut acc, row| {
        acc.total_earnings += row.amount;
        if row.created_at >= month_start {
            acc.monthly_earnings += row.amount;
        }
        if row.paid {
            acc.paid_earnings += row.amount;
        } else {
            acc.pending_earnings += row.amount;
        }
        acc
    })
}
