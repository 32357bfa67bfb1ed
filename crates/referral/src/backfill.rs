//! Replays succeeded payments through the calculator to recover commissions
//! whose webhook delivery was lost. Idempotent, so it can run at any time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledger_core::AppError;
use uuid::Uuid;

use crate::calculator::CommissionCalculator;
use crate::store::ReferralStore;

/// Position in the `(created_at, id)` ordering of succeeded payments.
pub type Cursor = (DateTime<Utc>, Uuid);

pub fn start_cursor() -> Cursor {
    (DateTime::<Utc>::UNIX_EPOCH, Uuid::nil())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillTotals {
    pub payments: usize,
    pub commissions: usize,
}

pub struct Backfill {
    store: Arc<dyn ReferralStore>,
    calculator: Arc<CommissionCalculator>,
    page_size: i64,
    cursor: Cursor,
    totals: BackfillTotals,
}

impl Backfill {
    pub fn new(
        store: Arc<dyn ReferralStore>,
        calculator: Arc<CommissionCalculator>,
        page_size: u64,
    ) -> Self {
        Self {
            store,
            calculator,
            page_size: i64::try_from(page_size.max(1)).unwrap_or(i64::MAX),
            cursor: start_cursor(),
            totals: BackfillTotals::default(),
        }
    }

    pub fn totals(&self) -> BackfillTotals {
        self.totals
    }

    /// Process the next page. Returns `Ok(false)` once every payment was seen.
    ///
    /// The cursor only advances past a payment after its commissions are
    /// recorded, so a failed page is retried from the same payment.
    pub async fn process_next_page(&mut self) -> Result<bool, AppError> {
        let page = self
            .store
            .succeeded_payments_after(self.cursor, self.page_size)
            .await?;
        if page.is_empty() {
            return Ok(false);
        }

        for payment in &page {
            let written = self.calculator.on_payment_succeeded(payment).await?;
            self.cursor = (payment.created_at, payment.id);
            self.totals.payments += 1;
            self.totals.commissions += written.len();
        }

        tracing::info!(
            payments = page.len(),
            total_payments = self.totals.payments,
            recovered = self.totals.commissions,
            "Backfill page complete"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FlatFeePolicy;
    use crate::store::MemoryStore;
    use ledger_storage::models::*;
    use rust_decimal::Decimal;

    async fn account(store: &MemoryStore, code: &str, referred_by: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_account(&NewAccount {
                id,
                first_name: "A".into(),
                last_name: "B".into(),
                kind: AccountKind::Client,
                referral_code: code.into(),
            })
            .await
            .unwrap();
        if let Some(by) = referred_by {
            store.set_referred_by_if_unset(id, by).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn recovers_missing_commissions_across_pages() {
        let store = Arc::new(MemoryStore::new());
        account(&store, "ref1", None).await;
        let mut payers = Vec::new();
        for i in 0..5 {
            payers.push(account(&store, &format!("payer{i}"), Some("ref1")).await);
        }

        // Payments stored without running the calculator, as if the
        // webhook handler crashed after persisting them.
        for payer in &payers {
            store
                .record_payment(&NewPayment {
                    id: Uuid::new_v4(),
                    user_id: *payer,
                    plan_id: None,
                    amount: Decimal::new(4999, 2),
                    currency: "USD".into(),
                    status: PaymentStatus::Succeeded,
                })
                .await
                .unwrap();
        }

        let calculator = Arc::new(CommissionCalculator::new(
            store.clone(),
            Arc::new(FlatFeePolicy::standard()),
        ));
        let mut backfill = Backfill::new(store.clone(), calculator.clone(), 2);
        while backfill.process_next_page().await.unwrap() {}

        assert_eq!(backfill.totals(), BackfillTotals { payments: 5, commissions: 5 });
        assert_eq!(store.transactions().len(), 5);

        let mut again = Backfill::new(store.clone(), calculator, 2);
        while again.process_next_page().await.unwrap() {}
        assert_eq!(again.totals(), BackfillTotals { payments: 5, commissions: 0 });
    }
}
