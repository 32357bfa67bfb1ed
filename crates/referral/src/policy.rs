//! Commission pricing.
//!
//! The calculator decides *who* gets paid (direct referrer, second-tier
//! referrer); a [`CommissionPolicy`] decides *how much*.

use std::fmt::Debug;
use std::sync::Arc;

use ledger_core::{CommissionMode, CommissionSettings};
use ledger_storage::models::Payment;
use rust_decimal::{Decimal, RoundingStrategy};

/// Direct referrer of the payer.
pub const TIER_DIRECT: i16 = 1;
/// Referrer of the direct referrer. Commissions never go deeper.
pub const TIER_SECOND: i16 = 2;

pub trait CommissionPolicy: Send + Sync + Debug {
    /// Commission owed for `payment` at `tier`; `None` pays nothing.
    fn commission(&self, payment: &Payment, tier: i16) -> Option<Decimal>;
}

/// Round to cents, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn positive(amount: Decimal) -> Option<Decimal> {
    (amount > Decimal::ZERO).then_some(amount)
}

/// Fixed amount per qualifying payment; the second tier earns a fraction of
/// the direct amount.
#[derive(Debug, Clone)]
pub struct FlatFeePolicy {
    pub direct: Decimal,
    pub second_tier_fraction: Decimal,
}

impl FlatFeePolicy {
    /// $25 per referral, 30% of that to the second tier.
    pub fn standard() -> Self {
        Self {
            direct: Decimal::new(2500, 2),
            second_tier_fraction: Decimal::new(3, 1),
        }
    }
}

impl CommissionPolicy for FlatFeePolicy {
    fn commission(&self, _payment: &Payment, tier: i16) -> Option<Decimal> {
        match tier {
            TIER_DIRECT => positive(round_money(self.direct)),
            TIER_SECOND => positive(round_money(self.direct * self.second_tier_fraction)),
            _ => None,
        }
    }
}

/// Share of the payment amount per tier.
#[derive(Debug, Clone)]
pub struct PercentagePolicy {
    pub direct_rate: Decimal,
    pub second_tier_rate: Decimal,
}

impl CommissionPolicy for PercentagePolicy {
    fn commission(&self, payment: &Payment, tier: i16) -> Option<Decimal> {
        let rate = match tier {
            TIER_DIRECT => self.direct_rate,
            TIER_SECOND => self.second_tier_rate,
            _ => return None,
        };
        positive(round_money(payment.amount * rate))
    }
}

/// Build the policy described by configuration.
pub fn from_settings(settings: &CommissionSettings) -> Arc<dyn CommissionPolicy> {
    match settings.mode {
        CommissionMode::Flat => Arc::new(FlatFeePolicy {
            direct: settings.direct,
            second_tier_fraction: settings.second_tier,
        }),
        CommissionMode::Percentage => Arc::new(PercentagePolicy {
            direct_rate: settings.direct,
            second_tier_rate: settings.second_tier,
        }),
    }
}

/// Effective share of the payment a commission represents, in percent.
pub fn effective_percentage(commission: Decimal, payment_amount: Decimal) -> Decimal {
    if payment_amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    commission
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|scaled| scaled.checked_div(payment_amount))
        .map(round_money)
        .unwrap_or(Decimal::ZERO)
}
