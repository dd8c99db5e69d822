//! Transaction monitoring rule engine: a restricted rule language compiled
//! and interpreted in-process, fan-out evaluation over an immutable active
//! config, shadow deployments with atomic promotion, and offline backtests
//! over the persisted event log.

pub mod api;
pub mod backtest;
pub mod engine;
pub mod middleware;
pub mod models;
pub mod rules;
pub mod shadow;
pub mod storage;
pub mod typing;
