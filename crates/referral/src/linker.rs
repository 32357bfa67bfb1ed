use std::collections::HashSet;
use std::sync::Arc;

use ledger_core::AppError;
use ledger_storage::models::{Account, AccountKind, NewAccount};
use uuid::Uuid;

use crate::code::{DEFAULT_RETRY_BUDGET, next_free_code};
use crate::store::{ReferralStore, StoreError};

/// A new account as handed over by the sign-up flow.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub kind: AccountKind,
    /// Code the registrant typed in or arrived with, if any.
    pub referral_code: Option<String>,
}

/// What [`ReferralLinker::link_referral`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// `referred_by` was already set; nothing written.
    AlreadyLinked,
    /// Blank code.
    NoCode,
    /// No account owns the code.
    UnknownCode,
    /// The code belongs to the account itself.
    SelfReferral,
    /// The referrer is (transitively) referred by this account.
    WouldCycle,
}

/// Assigns referral codes and records who referred whom.
pub struct ReferralLinker {
    store: Arc<dyn ReferralStore>,
    retry_budget: u32,
}

impl ReferralLinker {
    pub fn new(store: Arc<dyn ReferralStore>) -> Self {
        Self::with_retry_budget(store, DEFAULT_RETRY_BUDGET)
    }

    pub fn with_retry_budget(store: Arc<dyn ReferralStore>, retry_budget: u32) -> Self {
        Self {
            store,
            retry_budget: retry_budget.max(1),
        }
    }

    /// Create the account with a fresh referral code, then link the supplied
    /// code. Registering an existing account id only re-runs the link step.
    pub async fn register(&self, registration: &Registration) -> Result<Account, AppError> {
        let account = match self.store.account(registration.account_id).await? {
            Some(existing) => existing,
            None => self.create_account(registration).await?,
        };

        if let Some(code) = registration.referral_code.as_deref() {
            self.link_referral(account.id, code).await?;
            if let Some(reloaded) = self.store.account(account.id).await? {
                return Ok(reloaded);
            }
        }
        Ok(account)
    }

    /// Every candidate, whether rejected by the existence check or by the
    /// unique constraint at insert, counts against one retry budget.
    async fn create_account(&self, registration: &Registration) -> Result<Account, AppError> {
        let mut attempts = 0;
        loop {
            let referral_code = next_free_code(
                self.store.as_ref(),
                &registration.first_name,
                &registration.last_name,
                &mut attempts,
                self.retry_budget,
            )
            .await?;

            let new_account = NewAccount {
                id: registration.account_id,
                first_name: registration.first_name.trim().to_string(),
                last_name: registration.last_name.trim().to_string(),
                kind: registration.kind,
                referral_code,
            };

            match self.store.create_account(&new_account).await {
                Ok(account) => {
                    tracing::info!(
                        account_id = %account.id,
                        referral_code = %account.referral_code,
                        "Account registered"
                    );
                    return Ok(account);
                }
                Err(StoreError::CodeTaken(code)) => {
                    tracing::warn!(code = %code, attempt = attempts, "Referral code claimed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record that `account_id` was referred by the owner of `supplied_code`.
    ///
    /// Unknown, blank and self-owned codes are ignored; a link is written at
    /// most once. Only an unknown `account_id` is an error.
    pub async fn link_referral(
        &self,
        account_id: Uuid,
        supplied_code: &str,
    ) -> Result<LinkOutcome, AppError> {
        let code = supplied_code.trim();
        if code.is_empty() {
            return Ok(LinkOutcome::NoCode);
        }

        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;

        if account.referred_by.is_some() {
            return Ok(LinkOutcome::AlreadyLinked);
        }

        let Some(referrer) = self.store.account_by_code(code).await? else {
            tracing::info!(account_id = %account_id, code = %code, "Ignoring unknown referral code");
            return Ok(LinkOutcome::UnknownCode);
        };

        if referrer.id == account.id {
            tracing::warn!(account_id = %account_id, "Ignoring self-referral");
            return Ok(LinkOutcome::SelfReferral);
        }

        if self.chain_contains(&referrer, account.id).await? {
            tracing::warn!(
                account_id = %account_id,
                referrer_id = %referrer.id,
                "Ignoring referral that would create a cycle"
            );
            return Ok(LinkOutcome::WouldCycle);
        }

        if !self
            .store
            .set_referred_by_if_unset(account.id, &referrer.referral_code)
            .await?
        {
            return Ok(LinkOutcome::AlreadyLinked);
        }

        tracing::info!(
            account_id = %account_id,
            referrer_id = %referrer.id,
            code = %referrer.referral_code,
            "Referral linked"
        );
        Ok(LinkOutcome::Linked)
    }

    /// Walk `start`'s referrer chain looking for `needle`.
    async fn chain_contains(&self, start: &Account, needle: Uuid) -> Result<bool, AppError> {
        let mut visited = HashSet::from([start.id]);
        let mut next = start.referred_by.clone();

        while let Some(code) = next {
            let Some(ancestor) = self.store.account_by_code(&code).await? else {
                return Ok(false);
            };
            if ancestor.id == needle {
                return Ok(true);
            }
            if !visited.insert(ancestor.id) {
                return Ok(false);
            }
            next = ancestor.referred_by;
        }
        Ok(false)
    }
}
