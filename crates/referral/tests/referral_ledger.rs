use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ledger_core::AppError;
use ledger_referral::{
    CommissionCalculator, FlatFeePolicy, LedgerAggregator, LinkOutcome, MemoryStore,
    PaymentEvent, ReferralLinker, ReferralStats, ReferralStore, Registration,
};
use ledger_storage::models::{Account, AccountKind, NewAccount, PaymentStatus};
use rust_decimal::Decimal;
use uuid::Uuid;

struct Ledger {
    store: Arc<MemoryStore>,
    linker: ReferralLinker,
    calculator: CommissionCalculator,
    aggregator: LedgerAggregator,
}

fn ledger() -> Ledger {
    let store = Arc::new(MemoryStore::new());
    Ledger {
        linker: ReferralLinker::new(store.clone()),
        calculator: CommissionCalculator::new(store.clone(), Arc::new(FlatFeePolicy::standard())),
        aggregator: LedgerAggregator::new(store.clone()),
        store,
    }
}

fn usd(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn registration(first: &str, code: Option<&str>) -> Registration {
    Registration {
        account_id: Uuid::new_v4(),
        first_name: first.into(),
        last_name: "Tester".into(),
        kind: AccountKind::Client,
        referral_code: code.map(str::to_string),
    }
}

fn succeeded(payment_id: Uuid, user_id: Uuid, cents: i64) -> PaymentEvent {
    PaymentEvent {
        payment_id,
        user_id,
        amount: usd(cents),
        currency: "usd".into(),
        status: PaymentStatus::Succeeded,
        plan_id: Some("price_monthly".into()),
    }
}

impl Ledger {
    async fn register(&self, first: &str, code: Option<&str>) -> Account {
        self.linker.register(&registration(first, code)).await.unwrap()
    }

    async fn pay(&self, user_id: Uuid, cents: i64) -> usize {
        self.calculator
            .record_payment_event(succeeded(Uuid::new_v4(), user_id, cents))
            .await
            .unwrap()
            .commissions
            .len()
    }

    /// Account with a hand-picked referral code.
    async fn seed(&self, code: &str) -> Account {
        self.store
            .create_account(&NewAccount {
                id: Uuid::new_v4(),
                first_name: "Rae".into(),
                last_name: "Referrer".into(),
                kind: AccountKind::Advisor,
                referral_code: code.into(),
            })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn referred_payment_yields_flat_commission() {
    let l = ledger();
    let r = l.seed("R123").await;
    let b = l.register("Bea", Some("R123")).await;
    assert_eq!(b.referred_by.as_deref(), Some("R123"));

    let outcome = l
        .calculator
        .record_payment_event(succeeded(Uuid::new_v4(), b.id, 4999))
        .await
        .unwrap();

    assert_eq!(outcome.commissions.len(), 1);
    let row = &outcome.commissions[0];
    assert_eq!(row.referrer_id, r.id);
    assert_eq!(row.referee_id, b.id);
    assert_eq!(row.payment_id, outcome.payment.id);
    assert_eq!(row.amount, usd(2500));
    assert_eq!(row.percentage, usd(5001));
    assert_eq!(row.currency, "USD");
    assert!(!row.paid);

    let stats = l.aggregator.get_referral_stats("R123").await.unwrap();
    assert_eq!(
        stats,
        ReferralStats {
            total_referrals: 1,
            active_referrals: 1,
            total_earnings: usd(2500),
            monthly_earnings: usd(2500),
            paid_earnings: Decimal::ZERO,
            pending_earnings: usd(2500),
        }
    );
}

#[tokio::test]
async fn redelivered_payment_pays_once() {
    let l = ledger();
    l.seed("R123").await;
    let b = l.register("Bea", Some("R123")).await;
    let event = succeeded(Uuid::new_v4(), b.id, 4999);

    let first = l.calculator.record_payment_event(event.clone()).await.unwrap();
    let second = l.calculator.record_payment_event(event.clone()).await.unwrap();
    let direct = l.calculator.on_payment_succeeded(&first.payment).await.unwrap();

    assert_eq!(first.commissions.len(), 1);
    assert!(second.commissions.is_empty());
    assert!(direct.is_empty());
    assert_eq!(l.store.transactions().len(), 1);
}

#[tokio::test]
async fn concurrent_deliveries_pay_once() {
    let l = Arc::new(ledger());
    l.seed("R123").await;
    let b = l.register("Bea", Some("R123")).await;
    let event = succeeded(Uuid::new_v4(), b.id, 4999);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let l = l.clone();
            let event = event.clone();
            tokio::spawn(async move { l.calculator.record_payment_event(event).await })
        })
        .collect();

    let mut written = 0;
    for handle in handles {
        written += handle.await.unwrap().unwrap().commissions.len();
    }
    assert_eq!(written, 1);
    assert_eq!(l.store.transactions().len(), 1);
}

#[tokio::test]
async fn fresh_code_has_zero_stats() {
    let l = ledger();
    let a = l.register("Nia", None).await;

    let by_code = l.aggregator.get_referral_stats(&a.referral_code).await.unwrap();
    let by_id = l.aggregator.get_referral_stats_by_id(a.id).await.unwrap();
    assert_eq!(by_code, ReferralStats::default());
    assert_eq!(by_id, ReferralStats::default());
}

#[tokio::test]
async fn unknown_code_or_id_has_zero_stats() {
    let l = ledger();
    assert_eq!(
        l.aggregator.get_referral_stats("ghost0000").await.unwrap(),
        ReferralStats::default()
    );
    assert_eq!(l.aggregator.get_referral_stats("").await.unwrap(), ReferralStats::default());
    assert_eq!(
        l.aggregator.get_referral_stats_by_id(Uuid::new_v4()).await.unwrap(),
        ReferralStats::default()
    );
}

#[tokio::test]
async fn earnings_grow_with_each_paying_referral() {
    let l = ledger();
    let r = l.seed("R123").await;

    let mut referees = Vec::new();
    for name in ["Ann", "Bo", "Cy", "Di", "Ed"] {
        referees.push(l.register(name, Some("R123")).await);
    }
    for referee in &referees[..4] {
        assert_eq!(l.pay(referee.id, 9900).await, 1);
    }

    let stats = l.aggregator.get_referral_stats_by_id(r.id).await.unwrap();
    assert_eq!(stats.total_referrals, 5);
    assert_eq!(stats.active_referrals, 4);
    assert_eq!(stats.total_earnings, usd(4 * 2500));
}

#[tokio::test]
async fn active_counts_only_succeeded_payers() {
    let l = ledger();
    l.seed("R123").await;
    let a = l.register("Ann", Some("R123")).await;
    let b = l.register("Bo", Some("R123")).await;
    let c = l.register("Cy", Some("R123")).await;

    l.pay(a.id, 4999).await;
    l.pay(b.id, 4999).await;
    l.calculator
        .record_payment_event(PaymentEvent {
            status: PaymentStatus::Failed,
            ..succeeded(Uuid::new_v4(), c.id, 4999)
        })
        .await
        .unwrap();

    let stats = l.aggregator.get_referral_stats("R123").await.unwrap();
    assert_eq!(stats.total_referrals, 3);
    assert_eq!(stats.active_referrals, 2);
}

#[tokio::test]
async fn repeat_payments_count_one_active_referral() {
    let l = ledger();
    l.seed("R123").await;
    let a = l.register("Ann", Some("R123")).await;

    l.pay(a.id, 4999).await;
    l.pay(a.id, 4999).await;

    let stats = l.aggregator.get_referral_stats("R123").await.unwrap();
    assert_eq!(stats.active_referrals, 1);
    assert_eq!(stats.total_earnings, usd(5000));
}

#[tokio::test]
async fn pending_payment_earns_nothing_until_it_succeeds() {
    let l = ledger();
    l.seed("R123").await;
    let b = l.register("Bea", Some("R123")).await;
    let payment_id = Uuid::new_v4();

    let pending = l
        .calculator
        .record_payment_event(PaymentEvent {
            status: PaymentStatus::Pending,
            ..succeeded(payment_id, b.id, 4999)
        })
        .await
        .unwrap();
    assert!(pending.commissions.is_empty());
    assert_eq!(l.aggregator.get_referral_stats("R123").await.unwrap().active_referrals, 0);

    let settled = l
        .calculator
        .record_payment_event(succeeded(payment_id, b.id, 4999))
        .await
        .unwrap();
    assert_eq!(settled.payment.status, PaymentStatus::Succeeded);
    assert_eq!(settled.commissions.len(), 1);
}

#[tokio::test]
async fn settled_payment_cannot_change_status() {
    let l = ledger();
    let b = l.register("Bea", None).await;
    let payment_id = Uuid::new_v4();
    l.calculator
        .record_payment_event(succeeded(payment_id, b.id, 4999))
        .await
        .unwrap();

    let err = l
        .calculator
        .record_payment_event(PaymentEvent {
            status: PaymentStatus::Failed,
            ..succeeded(payment_id, b.id, 4999)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn malformed_events_are_rejected() {
    let l = ledger();
    let b = l.register("Bea", None).await;

    let negative = l
        .calculator
        .record_payment_event(succeeded(Uuid::new_v4(), b.id, -100))
        .await;
    assert!(matches!(negative, Err(AppError::Validation(_))));

    let bad_currency = l
        .calculator
        .record_payment_event(PaymentEvent {
            currency: "dollars".into(),
            ..succeeded(Uuid::new_v4(), b.id, 100)
        })
        .await;
    assert!(matches!(bad_currency, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn amounts_outside_the_stored_precision_are_rejected() {
    let l = ledger();
    l.seed("R123").await;
    let b = l.register("Bea", Some("R123")).await;

    for amount in [
        Decimal::new(1, 28),
        Decimal::new(4999, 3),
        Decimal::new(123_456_789_012_345, 3),
        Decimal::new(10_000_000_000, 0),
    ] {
        let result = l
            .calculator
            .record_payment_event(PaymentEvent {
                amount,
                ..succeeded(Uuid::new_v4(), b.id, 0)
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))), "{amount}");
    }
    assert!(l.store.transactions().is_empty());

    // Trailing zeros are still cents.
    let outcome = l
        .calculator
        .record_payment_event(PaymentEvent {
            amount: Decimal::new(49_990, 3),
            ..succeeded(Uuid::new_v4(), b.id, 0)
        })
        .await
        .unwrap();
    assert_eq!(outcome.commissions.len(), 1);

    let largest = l
        .calculator
        .record_payment_event(PaymentEvent {
            amount: Decimal::new(999_999_999_999, 2),
            ..succeeded(Uuid::new_v4(), b.id, 0)
        })
        .await
        .unwrap();
    assert_eq!(largest.commissions[0].percentage, Decimal::ZERO);
}

#[tokio::test]
async fn unreferred_payer_earns_nobody_anything() {
    let l = ledger();
    let b = l.register("Bea", None).await;
    assert_eq!(l.pay(b.id, 4999).await, 0);
    assert!(l.store.transactions().is_empty());
}

#[tokio::test]
async fn second_tier_is_capped_at_depth_two() {
    let l = ledger();
    let top = l.seed("TOP1").await;
    let mid = l.register("Mia", Some("TOP1")).await;
    let low = l.register("Lou", Some(&mid.referral_code)).await;
    let payer = l.register("Pat", Some(&low.referral_code)).await;

    let payment_id = Uuid::new_v4();
    let outcome = l
        .calculator
        .record_payment_event(succeeded(payment_id, payer.id, 4999))
        .await
        .unwrap();

    let mut rows = outcome.commissions;
    rows.sort_by_key(|r| r.tier);
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].referrer_id, rows[0].tier, rows[0].amount), (low.id, 1, usd(2500)));
    assert_eq!((rows[1].referrer_id, rows[1].tier, rows[1].amount), (mid.id, 2, usd(750)));
    assert!(rows.iter().all(|r| r.referee_id == payer.id));

    let top_stats = l.aggregator.get_referral_stats_by_id(top.id).await.unwrap();
    assert_eq!(top_stats.total_earnings, Decimal::ZERO);

    let again = l
        .calculator
        .record_payment_event(succeeded(payment_id, payer.id, 4999))
        .await
        .unwrap();
    assert!(again.commissions.is_empty());
    assert_eq!(l.store.transactions().len(), 2);
}

#[tokio::test]
async fn failed_write_records_nothing_and_retry_succeeds() {
    let l = ledger();
    l.seed("TOP1").await;
    let mid = l.register("Mia", Some("TOP1")).await;
    let payer = l.register("Pat", Some(&mid.referral_code)).await;
    let event = succeeded(Uuid::new_v4(), payer.id, 4999);

    l.store.fail_commission_writes(1);
    let err = l.calculator.record_payment_event(event.clone()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(l.store.transactions().is_empty());

    let retried = l.calculator.record_payment_event(event).await.unwrap();
    assert_eq!(retried.commissions.len(), 2);
}

#[tokio::test]
async fn no_account_refers_itself() {
    let l = ledger();
    let mut accounts = vec![l.register("Ann", None).await];
    for name in ["Bo", "Cy", "Di"] {
        let prev = accounts.last().unwrap().referral_code.clone();
        accounts.push(l.register(name, Some(&prev)).await);
    }
    for a in &accounts {
        l.linker.link_referral(a.id, &a.referral_code).await.unwrap();
    }

    for a in &accounts {
        let stored = l.store.account(a.id).await.unwrap().unwrap();
        assert_ne!(stored.referred_by.as_deref(), Some(stored.referral_code.as_str()));
    }
}

#[tokio::test]
async fn linking_twice_is_idempotent() {
    let l = ledger();
    let r = l.seed("R123").await;
    let other = l.seed("OTHER9").await;
    let reg = registration("Bea", Some("R123"));

    let first = l.linker.register(&reg).await.unwrap();
    let second = l.linker.register(&reg).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.referral_code, second.referral_code);
    assert_eq!(second.referred_by.as_deref(), Some("R123"));

    assert_eq!(
        l.linker.link_referral(first.id, "R123").await.unwrap(),
        LinkOutcome::AlreadyLinked
    );
    assert_eq!(
        l.linker.link_referral(first.id, &other.referral_code).await.unwrap(),
        LinkOutcome::AlreadyLinked
    );
    assert_eq!(l.aggregator.get_referral_stats_by_id(r.id).await.unwrap().total_referrals, 1);
    assert_eq!(
        l.aggregator.get_referral_stats_by_id(other.id).await.unwrap().total_referrals,
        0
    );
}

#[tokio::test]
async fn monthly_earnings_use_utc_calendar_month() {
    let l = ledger();
    l.seed("R123").await;
    let a = l.register("Ann", Some("R123")).await;
    let b = l.register("Bo", Some("R123")).await;

    let last_instant_of_feb = Utc.with_ymd_and_hms(2025, 2, 28, 23, 59, 59).unwrap();
    let first_instant_of_mar = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

    l.store.pin_clock(last_instant_of_feb);
    l.pay(a.id, 4999).await;
    l.store.pin_clock(first_instant_of_mar);
    l.pay(b.id, 4999).await;

    let in_march = Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap();
    let stats = l.aggregator.get_referral_stats_at("R123", in_march).await.unwrap();
    assert_eq!(stats.total_earnings, usd(5000));
    assert_eq!(stats.monthly_earnings, usd(2500));

    let in_april = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
    let stats = l.aggregator.get_referral_stats_at("R123", in_april).await.unwrap();
    assert_eq!(stats.monthly_earnings, Decimal::ZERO);
}

#[tokio::test]
async fn payout_marks_only_own_unpaid_rows() {
    let l = ledger();
    let r = l.seed("R123").await;
    let other = l.seed("OTHER9").await;
    let a = l.register("Ann", Some("R123")).await;
    let b = l.register("Bo", Some("OTHER9")).await;
    l.pay(a.id, 4999).await;
    l.pay(a.id, 4999).await;
    l.pay(b.id, 4999).await;

    let mine = l.aggregator.commissions(r.id).await.unwrap();
    let theirs = l.aggregator.commissions(other.id).await.unwrap();
    assert_eq!(mine.len(), 2);

    let ids = vec![mine[0].id, theirs[0].id];
    assert_eq!(l.calculator.mark_paid(r.id, &ids).await.unwrap(), 1);
    assert_eq!(l.calculator.mark_paid(r.id, &ids).await.unwrap(), 0);

    let stats = l.aggregator.get_referral_stats("R123").await.unwrap();
    assert_eq!(stats.paid_earnings, usd(2500));
    assert_eq!(stats.pending_earnings, usd(2500));
    assert_eq!(stats.total_earnings, usd(5000));

    let theirs = l.aggregator.commissions(other.id).await.unwrap();
    assert!(!theirs[0].paid);
}

#[tokio::test]
async fn dangling_referral_code_is_tolerated() {
    let l = ledger();
    let orphan = l
        .store
        .create_account(&NewAccount {
            id: Uuid::new_v4(),
            first_name: "Oli".into(),
            last_name: "Orphan".into(),
            kind: AccountKind::Client,
            referral_code: "olio1234".into(),
        })
        .await
        .unwrap();
    // Bypass the linker to simulate a row whose referrer vanished.
    assert!(l.store.set_referred_by_if_unset(orphan.id, "gone0000").await.unwrap());

    assert_eq!(l.pay(orphan.id, 4999).await, 0);
}

#[tokio::test]
async fn payment_from_unknown_account_is_rejected() {
    let l = ledger();
    let err = l
        .calculator
        .record_payment_event(succeeded(Uuid::new_v4(), Uuid::new_v4(), 4999))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccountNotFound(_)));
}
