use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ─── Account ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Client,
    Advisor,
}

/// A person using the platform.
///
/// `referral_code` is assigned once at registration; `referred_by` holds the
/// referrer's code and is written at most once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub kind: AccountKind,
    pub referral_code: String,
    pub referred_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert-ready account (no `referred_by` or `created_at`).
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub kind: AccountKind,
    pub referral_code: String,
}

// ─── Payment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    /// `pending` may settle either way; settled payments never change.
    /// Re-applying the current status is always allowed (webhook redelivery).
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        *self == next || *self == PaymentStatus::Pending
    }
}

/// A payment recorded from the payment processor webhook.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-ready payment, as delivered by the webhook.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
}

// ─── ReferralTransaction ────────────────────────────────────────────────────

/// One commission owed to a referrer. Append-only; only `paid` ever flips.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReferralTransaction {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Uuid,
    pub payment_id: Uuid,
    pub tier: i16,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert-ready commission row (no `paid`, `paid_at` or `created_at`).
#[derive(Debug, Clone, PartialEq)]
pub struct NewReferralTransaction {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Uuid,
    pub payment_id: Uuid,
    pub tier: i16,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub currency: String,
}
