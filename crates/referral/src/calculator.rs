use std::sync::Arc;

use ledger_core::AppError;
use ledger_storage::models::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::policy::{CommissionPolicy, TIER_DIRECT, TIER_SECOND, effective_percentage};
use crate::store::ReferralStore;

/// 10^10, the first amount `payments.amount NUMERIC(12, 2)` cannot hold.
const MAX_AMOUNT: Decimal = Decimal::from_parts(1_410_065_408, 2, 0, false, 0);
/// Payments are stored to the cent.
const AMOUNT_SCALE: u32 = 2;

/// Normalized payment notification from the payment processor.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl PaymentEvent {
    fn into_new_payment(self) -> Result<NewPayment, AppError> {
        if self.amount < Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "payment {} has negative amount {}",
                self.payment_id, self.amount
            )));
        }
        if self.amount.normalize().scale() > AMOUNT_SCALE {
            return Err(AppError::Validation(format!(
                "payment {} amount {} has more than {AMOUNT_SCALE} decimal places",
                self.payment_id, self.amount
            )));
        }
        if self.amount >= MAX_AMOUNT {
            return Err(AppError::Validation(format!(
                "payment {} amount {} exceeds {MAX_AMOUNT}",
                self.payment_id, self.amount
            )));
        }
        let currency = self.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::Validation(format!(
                "payment {} has invalid currency `{}`",
                self.payment_id, self.currency
            )));
        }

        Ok(NewPayment {
            id: self.payment_id,
            user_id: self.user_id,
            plan_id: self.plan_id.filter(|p| !p.trim().is_empty()),
            amount: self.amount,
            currency,
            status: self.status,
        })
    }
}

/// Result of processing one payment notification.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub payment: Payment,
    /// Commission rows written by this delivery; empty on redelivery.
    pub commissions: Vec<ReferralTransaction>,
}

/// Turns succeeded payments into commission rows.
pub struct CommissionCalculator {
    store: Arc<dyn ReferralStore>,
    policy: Arc<dyn CommissionPolicy>,
}

impl CommissionCalculator {
    pub fn new(store: Arc<dyn ReferralStore>, policy: Arc<dyn CommissionPolicy>) -> Self {
        Self { store, policy }
    }

    /// Store the payment's new status and, once it is `succeeded`, compute
    /// commissions. Safe to call again for the same event.
    pub async fn record_payment_event(
        &self,
        event: PaymentEvent,
    ) -> Result<PaymentOutcome, AppError> {
        let expected_user = event.user_id;
        if self.store.account(expected_user).await?.is_none() {
            return Err(AppError::AccountNotFound(expected_user.to_string()));
        }
        let payment = self.store.record_payment(&event.into_new_payment()?).await?;

        if payment.user_id != expected_user {
            tracing::warn!(
                payment_id = %payment.id,
                stored_user = %payment.user_id,
                event_user = %expected_user,
                "Payment event disagrees with stored payer, using stored payer"
            );
        }

        let commissions = if payment.status == PaymentStatus::Succeeded {
            self.on_payment_succeeded(&payment).await?
        } else {
            Vec::new()
        };

        Ok(PaymentOutcome {
            payment,
            commissions,
        })
    }

    /// Compute and record the commissions owed for a succeeded payment.
    ///
    /// Returns only rows written by this call. A payer without a referrer, or
    /// a referrer code that no longer resolves, yields nothing. Store
    /// failures are returned so the delivery can be retried; nothing is
    /// partially written.
    pub async fn on_payment_succeeded(
        &self,
        payment: &Payment,
    ) -> Result<Vec<ReferralTransaction>, AppError> {
        if payment.status != PaymentStatus::Succeeded || payment.amount <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let Some(payer) = self.store.account(payment.user_id).await? else {
            tracing::warn!(
                payment_id = %payment.id,
                user_id = %payment.user_id,
                "Payment from unknown account, no commission"
            );
            return Ok(Vec::new());
        };
        let Some(code) = payer.referred_by.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(referrer) = self.store.account_by_code(code).await? else {
            tracing::warn!(
                payment_id = %payment.id,
                payer_id = %payer.id,
                code = %code,
                "Referral code no longer resolves, no commission"
            );
            return Ok(Vec::new());
        };

        let mut rows = Vec::with_capacity(2);
        if let Some(row) = self.commission_row(payment, &payer, &referrer, TIER_DIRECT) {
            rows.push(row);
        }
        if let Some(second) = self.second_tier_referrer(payment, &payer, &referrer).await? {
            if let Some(row) = self.commission_row(payment, &payer, &second, TIER_SECOND) {
                rows.push(row);
            }
        }

        let inserted = self.store.insert_commissions(&rows).await.map_err(|e| {
            tracing::error!(payment_id = %payment.id, error = %e, "Failed to record commissions");
            e
        })?;

        if inserted.len() < rows.len() {
            tracing::info!(
                payment_id = %payment.id,
                skipped = rows.len() - inserted.len(),
                "Commission already recorded for payment"
            );
        }
        for row in &inserted {
            tracing::info!(
                payment_id = %payment.id,
                referrer_id = %row.referrer_id,
                referee_id = %row.referee_id,
                tier = row.tier,
                amount = %row.amount,
                "Commission recorded"
            );
        }

        Ok(inserted)
    }

    async fn second_tier_referrer(
        &self,
        payment: &Payment,
        payer: &Account,
        referrer: &Account,
    ) -> Result<Option<Account>, AppError> {
        let Some(code) = referrer.referred_by.as_deref() else {
            return Ok(None);
        };

        match self.store.account_by_code(code).await? {
            Some(second) if second.id != payer.id && second.id != referrer.id => Ok(Some(second)),
            Some(second) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    account_id = %second.id,
                    "Referral chain loops back, skipping second tier"
                );
                Ok(None)
            }
            None => {
                tracing::warn!(
                    payment_id = %payment.id,
                    referrer_id = %referrer.id,
                    code = %code,
                    "Second-tier referral code no longer resolves"
                );
                Ok(None)
            }
        }
    }

    fn commission_row(
        &self,
        payment: &Payment,
        payer: &Account,
        beneficiary: &Account,
        tier: i16,
    ) -> Option<NewReferralTransaction> {
        let amount = self.policy.commission(payment, tier)?;
        Some(NewReferralTransaction {
            id: Uuid::new_v4(),
            referrer_id: beneficiary.id,
            referee_id: payer.id,
            payment_id: payment.id,
            tier,
            percentage: effective_percentage(amount, payment.amount),
            amount,
            currency: payment.currency.clone(),
        })
    }

    /// Payout reconciliation: mark a referrer's rows as paid. Returns how
    /// many rows flipped; rows already paid or owned by others are skipped.
    pub async fn mark_paid(&self, referrer_id: Uuid, ids: &[Uuid]) -> Result<u64, AppError> {
        let marked = self.store.mark_paid(referrer_id, ids).await?;
        tracing::info!(referrer_id = %referrer_id, requested = ids.len(), marked, "Commissions paid out");
        Ok(marked)
    }
}
