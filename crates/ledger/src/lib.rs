//! Worker compensation ledger.
//!
//! Business rules for wage accruals, kasbon advances, cash payments and
//! settlements, implemented purely as deterministic domain logic (no IO,
//! no HTTP, no storage).

pub mod records;
pub mod settlement;
pub mod summary;

pub use records::{
    AccrualId, CashPayment, KasbonAdvance, KasbonId, KasbonStatus, PaymentId, PaymentKind,
    Settlement, SettlementId, WageAccrual,
};
pub use settlement::{plan_settlement, KasbonRepayment, SettlementPlan};
pub use summary::{summarize, WorkerBalance};
