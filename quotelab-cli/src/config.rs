//! Serializable run configuration.

use serde::{Deserialize, Serialize};

use quotelab_core::broker::commission::{
    Commission, FixedPerTrade, NoCommission, TradePercentage,
};
use quotelab_core::domain::order::Rounding;

/// Everything needed to reproduce one backtest run, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Starting cash for the broker ledger.
    pub initial_cash: f64,

    /// Instrument the demo strategy trades.
    pub instrument: String,

    /// Order size per entry.
    pub quantity: f64,

    /// Fast moving-average period.
    pub fast: usize,

    /// Slow moving-average period.
    pub slow: usize,

    /// Commission scheme applied to every execution.
    pub commission: CommissionConfig,

    /// Quantity rounding policy.
    pub rounding: RoundingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            initial_cash: 100_000.0,
            instrument: "eurusd".to_string(),
            quantity: 10.0,
            fast: 10,
            slow: 30,
            commission: CommissionConfig::None,
            rounding: RoundingConfig::WholeShares,
        }
    }
}

/// Commission scheme (serializable enum).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommissionConfig {
    /// No fees.
    None,
    /// Fixed amount per trade, charged on the first fill.
    FixedPerTrade { amount: f64 },
    /// Fraction of traded notional (0.01 means 1%).
    Percentage { rate: f64 },
}

impl CommissionConfig {
    pub fn build(&self) -> Box<dyn Commission> {
        match self {
            CommissionConfig::None => Box::new(NoCommission),
            CommissionConfig::FixedPerTrade { amount } => Box::new(FixedPerTrade::new(*amount)),
            CommissionConfig::Percentage { rate } => Box::new(TradePercentage::new(*rate)),
        }
    }
}

/// Quantity rounding policy (serializable enum).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundingConfig {
    WholeShares,
    Decimals { places: u32 },
    Exact,
}

impl RoundingConfig {
    pub fn build(self) -> Rounding {
        match self {
            RoundingConfig::WholeShares => Rounding::WholeShares,
            RoundingConfig::Decimals { places } => Rounding::Decimals(places),
            RoundingConfig::Exact => Rounding::Exact,
        }
    }
}
