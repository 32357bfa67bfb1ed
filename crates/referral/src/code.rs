//! Referral code generation.
//!
//! Codes look like `johnd4821`: up to four characters of the first name, the
//! first character of the last name, then a four digit salt.

use ledger_core::AppError;
use rand::Rng;

use crate::store::ReferralStore;

/// Attempts before giving up with [`AppError::CodeGenerationExhausted`].
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

const FIRST_NAME_CHARS: usize = 4;
const FALLBACK_PREFIX: &str = "user";

/// Lowercase name fragment every candidate code starts with.
pub fn code_prefix(first_name: &str, last_name: &str) -> String {
    let alnum = |s: &str| {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };

    let mut prefix: String = alnum(first_name).chars().take(FIRST_NAME_CHARS).collect();
    prefix.extend(alnum(last_name).chars().take(1));

    if prefix.is_empty() {
        FALLBACK_PREFIX.to_string()
    } else {
        prefix
    }
}

/// One candidate code; uniqueness is not checked.
pub fn candidate_code<R: Rng + ?Sized>(first_name: &str, last_name: &str, rng: &mut R) -> String {
    let salt: u16 = rng.gen_range(1000..10000);
    format!("{}{salt}", code_prefix(first_name, last_name))
}

/// Produce a code no account currently owns.
///
/// A free code can still be claimed concurrently before it is inserted, so
/// callers must also retry on a unique-constraint conflict at insert time.
pub async fn generate_referral_code(
    store: &dyn ReferralStore,
    first_name: &str,
    last_name: &str,
    retry_budget: u32,
) -> Result<String, AppError> {
    let mut attempts = 0;
    next_free_code(store, first_name, last_name, &mut attempts, retry_budget).await
}

/// Like [`generate_referral_code`], but spends from a caller-owned attempt
/// counter so that insert conflicts and existence collisions share one budget.
pub(crate) async fn next_free_code(
    store: &dyn ReferralStore,
    first_name: &str,
    last_name: &str,
    attempts: &mut u32,
    retry_budget: u32,
) -> Result<String, AppError> {
    while *attempts < retry_budget {
        *attempts += 1;
        let code = candidate_code(first_name, last_name, &mut rand::thread_rng());
        if !store.code_exists(&code).await? {
            return Ok(code);
        }
        tracing::debug!(code = %code, attempt = *attempts, "Referral code collision, re-rolling");
    }

    tracing::error!(retry_budget, "Referral code generation exhausted");
    Err(AppError::CodeGenerationExhausted(retry_budget))
}
