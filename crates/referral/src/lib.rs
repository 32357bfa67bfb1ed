//! Referral ledger engine: links referrals at registration, turns succeeded
//! payments into commission rows, and summarizes the ledger for display.

pub mod aggregator;
pub mod backfill;
pub mod calculator;
pub mod code;
pub mod linker;
pub mod policy;
pub mod store;

pub use aggregator::{LedgerAggregator, ReferralStats};
pub use backfill::{Backfill, BackfillTotals};
pub use calculator::{CommissionCalculator, PaymentEvent, PaymentOutcome};
pub use code::generate_referral_code;
pub use linker::{LinkOutcome, ReferralLinker, Registration};
pub use policy::{CommissionPolicy, FlatFeePolicy, PercentagePolicy};
pub use store::{MemoryStore, PgStore, ReferralStore, StoreError};
