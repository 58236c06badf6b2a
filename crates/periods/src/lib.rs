//! Growing periods and the period ledger rollup.
//!
//! A period is one season/cycle for a farm with its own opening/closing cash
//! balance. Closing is one-way: the closing balance is computed once from the
//! period's full income/expense history and frozen.

pub mod period;

pub use period::{
    Expense, ExpenseId, Income, IncomeId, Period, PeriodClose, PeriodStatus,
};
