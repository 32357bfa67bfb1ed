use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::*;

// ─── Account Queries ────────────────────────────────────────────────────────

/// Insert a new account. Returns `None` when the referral code is already
/// taken, so callers can re-roll the code.
pub async fn insert_account<'e, E>(
    executor: E,
    account: &NewAccount,
) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (id, first_name, last_name, kind, referral_code)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (referral_code) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(account.id)
    .bind(&account.first_name)
    .bind(&account.last_name)
    .bind(account.kind)
    .bind(&account.referral_code)
    .fetch_optional(executor)
    .await
}

/// Get a single account by id.
pub async fn get_account(pool: &PgPool, id: Uuid) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Get the account owning a referral code.
pub async fn get_account_by_code(
    pool: &PgPool,
    code: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE referral_code = $1")
        .bind(code)
        .fetch_optional(pool)
        .await
}

/// Whether a referral code is already assigned.
pub async fn referral_code_exists(pool: &PgPool, code: &str) -> Result<bool, sqlx::Error> {
    let row: (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM accounts WHERE referral_code = $1)")
            .bind(code)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

/// Write `referred_by` only if it is still unset and not the account's own
/// code. Returns `true` when the row changed.
pub async fn set_referred_by_if_unset(
    pool: &PgPool,
    account_id: Uuid,
    code: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET referred_by = $2
        WHERE id = $1 AND referred_by IS NULL AND referral_code <> $2
        "#,
    )
    .bind(account_id)
    .bind(code)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Number of accounts linked to a referral code, paying or not.
pub async fn count_referred(pool: &PgPool, code: &str) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts WHERE referred_by = $1")
        .bind(code)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Number of referred accounts with at least one succeeded payment.
pub async fn count_active_referred(pool: &PgPool, code: &str) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(DISTINCT a.id)
        FROM accounts a
        JOIN payments p ON p.user_id = a.id
        WHERE a.referred_by = $1 AND p.status = 'succeeded'
        "#,
    )
    .bind(code)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

// ─── Payment Queries ────────────────────────────────────────────────────────

/// Get a payment by id, locking the row for the rest of the transaction.
pub async fn get_payment_for_update<'e, E>(
    executor: E,
    id: Uuid,
) -> Result<Option<Payment>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Insert a payment; a concurrent insert of the same id wins and this
/// returns `None`.
pub async fn insert_payment<'e, E>(
    executor: E,
    payment: &NewPayment,
) -> Result<Option<Payment>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (id, user_id, plan_id, amount, currency, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(payment.id)
    .bind(payment.user_id)
    .bind(&payment.plan_id)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(payment.status)
    .fetch_optional(executor)
    .await
}

/// Move a payment to a new status.
pub async fn update_payment_status<'e, E>(
    executor: E,
    id: Uuid,
    status: PaymentStatus,
) -> Result<Payment, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Payment>(
        "UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(status)
    .fetch_one(executor)
    .await
}

/// Succeeded payments strictly after the `(created_at, id)` cursor, oldest first.
pub async fn get_succeeded_payments_after(
    pool: &PgPool,
    after: (DateTime<Utc>, Uuid),
    limit: i64,
) -> Result<Vec<Payment>, sqlx::Error> {
    sqlx::query_as::<_, Payment>(
        r#"
        SELECT * FROM payments
        WHERE status = 'succeeded' AND (created_at, id) > ($1, $2)
        ORDER BY created_at, id
        LIMIT $3
        "#,
    )
    .bind(after.0)
    .bind(after.1)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ─── Referral Transaction Queries ───────────────────────────────────────────

/// Insert a batch of commission rows using a single multi-value INSERT.
/// Skips rows whose (referrer_id, payment_id) already exists and returns
/// only the rows actually written.
pub async fn insert_referral_transactions_batch<'e, E>(
    executor: E,
    rows: &[NewReferralTransaction],
) -> Result<Vec<ReferralTransaction>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO referral_transactions (id, referrer_id, referee_id, payment_id, tier, percentage, amount, currency) ",
    );

    qb.push_values(rows, |mut b, r| {
        b.push_bind(r.id)
            .push_bind(r.referrer_id)
            .push_bind(r.referee_id)
            .push_bind(r.payment_id)
            .push_bind(r.tier)
            .push_bind(r.percentage)
            .push_bind(r.amount)
            .push_bind(&r.currency);
    });

    qb.push(" ON CONFLICT (referrer_id, payment_id) DO NOTHING RETURNING *");
    qb.build_query_as::<ReferralTransaction>()
        .fetch_all(executor)
        .await
}

/// All commission rows owed to a referrer, newest first.
pub async fn get_referrer_transactions(
    pool: &PgPool,
    referrer_id: Uuid,
) -> Result<Vec<ReferralTransaction>, sqlx::Error> {
    sqlx::query_as::<_, ReferralTransaction>(
        "SELECT * FROM referral_transactions WHERE referrer_id = $1 ORDER BY created_at DESC, id",
    )
    .bind(referrer_id)
    .fetch_all(pool)
    .await
}

/// Flip `paid` for the given rows of one referrer. Rows already paid or
/// owned by someone else are left alone.
pub async fn mark_transactions_paid(
    pool: &PgPool,
    referrer_id: Uuid,
    ids: &[Uuid],
) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        UPDATE referral_transactions
        SET paid = TRUE, paid_at = NOW()
        WHERE referrer_id = $1 AND id = ANY($2) AND paid = FALSE
        "#,
    )
    .bind(referrer_id)
    .bind(ids)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
