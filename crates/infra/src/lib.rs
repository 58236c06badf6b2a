//! Infrastructure layer: the operations contract and its stores.
//!
//! The domain crates decide; this crate persists and serializes access. Two
//! stores exist: an in-memory one (tests/dev) and a Postgres one using
//! row-level locking for the settlement path.

pub mod ops;
pub mod store;

pub use ops::{
    FarmOps, LedgerScope, NewCashPayment, NewKasbonAdvance, NewWageAccrual, SettleRequest,
};
pub use store::memory::InMemoryFarmStore;
pub use store::postgres::{PostgresFarmStore, StoreError};

#[cfg(test)]
mod integration_tests;
