use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_storage::models::*;
use uuid::Uuid;

use super::{ReferralStore, StoreError};

/// In-process [`ReferralStore`] with the same uniqueness and atomicity rules
/// as the Postgres schema. Every operation runs under a single lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, Account>,
    codes: HashMap<String, Uuid>,
    payments: HashMap<Uuid, Payment>,
    transactions: Vec<ReferralTransaction>,
    /// Timestamp stamped on new rows instead of the wall clock.
    pinned_now: Option<DateTime<Utc>>,
    /// Number of upcoming `insert_commissions` calls that fail.
    failing_commission_writes: u32,
    /// Number of upcoming `create_account` calls that lose their code to a
    /// concurrent registration.
    stolen_code_inserts: u32,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        self.pinned_now.unwrap_or_else(Utc::now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Stamp every row created from now on with `now`.
    pub fn pin_clock(&self, now: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pinned_now = Some(now);
        }
    }

    /// Make the next `count` commission writes fail as a lost connection would.
    pub fn fail_commission_writes(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_commission_writes = count;
        }
    }

    /// Make the next `count` account inserts hit a referral code conflict,
    /// as if another registration claimed the code after it was checked.
    pub fn steal_codes(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stolen_code_inserts = count;
        }
    }

    /// Snapshot of every ledger row, in insertion order.
    pub fn transactions(&self) -> Vec<ReferralTransaction> {
        self.inner
            .lock()
            .map(|inner| inner.transactions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReferralStore for MemoryStore {
    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let mut inner = self.lock()?;
        if inner.stolen_code_inserts > 0 {
            inner.stolen_code_inserts -= 1;
            return Err(StoreError::CodeTaken(account.referral_code.clone()));
        }
        if inner.codes.contains_key(&account.referral_code) {
            return Err(StoreError::CodeTaken(account.referral_code.clone()));
        }
        if inner.accounts.contains_key(&account.id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate account id {}",
                account.id
            )));
        }

        let row = Account {
            id: account.id,
            first_name: account.first_name.clone(),
            last_name: account.last_name.clone(),
            kind: account.kind,
            referral_code: account.referral_code.clone(),
            referred_by: None,
            created_at: inner.now(),
        };
        inner.codes.insert(row.referral_code.clone(), row.id);
        inner.accounts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn account_by_code(&self, code: &str) -> Result<Option<Account>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .codes
            .get(code)
            .and_then(|id| inner.accounts.get(id))
            .cloned())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.codes.contains_key(code))
    }

    async fn set_referred_by_if_unset(
        &self,
        account_id: Uuid,
        code: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.accounts.get_mut(&account_id) {
            Some(account) if account.referred_by.is_none() && account.referral_code != code => {
                account.referred_by = Some(code.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError> {
        let mut inner = self.lock()?;
        let now = inner.now();

        if let Some(existing) = inner.payments.get_mut(&payment.id) {
            if existing.status == payment.status {
                return Ok(existing.clone());
            }
            if !existing.status.can_transition_to(payment.status) {
                return Err(StoreError::InvalidTransition {
                    id: payment.id,
                    from: existing.status.as_str(),
                    to: payment.status.as_str(),
                });
            }
            existing.status = payment.status;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let row = Payment {
            id: payment.id,
            user_id: payment.user_id,
            plan_id: payment.plan_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            status: payment.status,
            created_at: now,
            updated_at: now,
        };
        inner.payments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn succeeded_payments_after(
        &self,
        after: (DateTime<Utc>, Uuid),
        limit: i64,
    ) -> Result<Vec<Payment>, StoreError> {
        let inner = self.lock()?;
        let mut page: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Succeeded && (p.created_at, p.id) > after)
            .cloned()
            .collect();
        page.sort_by_key(|p| (p.created_at, p.id));
        page.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(page)
    }

    async fn insert_commissions(
        &self,
        rows: &[NewReferralTransaction],
    ) -> Result<Vec<ReferralTransaction>, StoreError> {
        let mut inner = self.lock()?;
        if inner.failing_commission_writes > 0 {
            inner.failing_commission_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let now = inner.now();
        let mut seen: HashSet<(Uuid, Uuid)> = inner
            .transactions
            .iter()
            .map(|t| (t.referrer_id, t.payment_id))
            .collect();

        let mut inserted = Vec::new();
        for row in rows {
            if !seen.insert((row.referrer_id, row.payment_id)) {
                continue;
            }
            inserted.push(ReferralTransaction {
                id: row.id,
                referrer_id: row.referrer_id,
                referee_id: row.referee_id,
                payment_id: row.payment_id,
                tier: row.tier,
                percentage: row.percentage,
                amount: row.amount,
                currency: row.currency.clone(),
                paid: false,
                paid_at: None,
                created_at: now,
            });
        }
        inner.transactions.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn referrer_transactions(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralTransaction>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<ReferralTransaction> = inner
            .transactions
            .iter()
            .filter(|t| t.referrer_id == referrer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn count_referred(&self, code: &str) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        let count = inner
            .accounts
            .values()
            .filter(|a| a.referred_by.as_deref() == Some(code))
            .count();
        Ok(count as i64)
    }

    async fn count_active_referred(&self, code: &str) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        let paying: HashSet<Uuid> = inner
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .map(|p| p.user_id)
            .collect();
        let count = inner
            .accounts
            .values()
            .filter(|a| a.referred_by.as_deref() == Some(code) && paying.contains(&a.id))
            .count();
        Ok(count as i64)
    }

    async fn mark_paid(&self, referrer_id: Uuid, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let now = inner.now();
        let mut changed = 0;
        for row in inner
            .transactions
            .iter_mut()
            .filter(|t| t.referrer_id == referrer_id && !t.paid && ids.contains(&t.id))
        {
            row.paid = true;
            row.paid_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }
}
