//! Multi-asset Monte Carlo projection engine for a personal investment
//! account.
//!
//! Given starting balances, a monthly contribution plan, per-asset expected
//! return/volatility, annual maintenance costs and an optional rule-based
//! withdrawal schedule, [`core::run_simulation`] evaluates thousands of
//! independent stochastic paths and reduces them to per-year percentile
//! summaries. Asset statistics are resolved by the caller; this crate only
//! simulates and aggregates.

pub mod core;
