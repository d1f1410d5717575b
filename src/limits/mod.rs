//! Spending-limit enforcement.

pub mod guard;

pub use guard::{
    parse_amount, Allowance, LimitError, LimitResult, LimitStatus, SpendingLimitGuard, WindowMode,
};
