//! Core data types shared by the rebalancers, the optimizer and the backtester.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved ticker for the cash position.
pub const CASH: &str = "CASH";

/// Ticker → weight mapping (target or actual).
pub type Weights = BTreeMap<String, f64>;

/// Ticker → current price mapping.
pub type AssetPrices = BTreeMap<String, f64>;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A dollar-denominated trade instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub action: Side,
    pub ticker: String,
    /// Dollar amount, always positive.
    pub amount: f64,
}

impl Trade {
    pub fn buy(ticker: impl Into<String>, amount: f64) -> Self {
        Self {
            action: Side::Buy,
            ticker: ticker.into(),
            amount,
        }
    }

    pub fn sell(ticker: impl Into<String>, amount: f64) -> Self {
        Self {
            action: Side::Sell,
            ticker: ticker.into(),
            amount,
        }
    }

    /// Signed dollar change to the traded position.
    pub fn signed_amount(&self) -> f64 {
        match self.action {
            Side::Buy => self.amount,
            Side::Sell => -self.amount,
        }
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ${:.2}", self.action, self.ticker, self.amount)
    }
}

/// A trade executed during a backtest, tagged with its date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedTrade {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub trade: Trade,
}

/// Trading parameters shared by both rebalancers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingParams {
    /// Minimum dollar amount for a trade to be executed.
    #[serde(default = "default_min_trade_threshold")]
    pub min_trade_threshold: f64,
    /// Minimum cash to keep in the portfolio.
    #[serde(default)]
    pub min_cash_reserve: f64,
    /// Fixed fee charged per executed trade.
    #[serde(default)]
    pub fees_per_trade: f64,
    /// Round trade amounts to whole shares using the ticker's price.
    #[serde(default)]
    pub round_to_nearest_share: bool,
}

fn default_min_trade_threshold() -> f64 {
    0.01
}

impl Default for TradingParams {
    fn default() -> Self {
        Self {
            min_trade_threshold: default_min_trade_threshold(),
            min_cash_reserve: 0.0,
            fees_per_trade: 0.0,
            round_to_nearest_share: false,
        }
    }
}

/// Outcome of a solve (or of a closed-form computation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    NearOptimal,
    Infeasible,
    IterationLimit,
    TimeLimit,
    NumericalError,
    Error,
}

impl SolveStatus {
    /// Whether the solution can be used.
    pub fn is_optimal(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::NearOptimal)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::NearOptimal => "optimal_near",
            SolveStatus::Infeasible => "infeasible",
            SolveStatus::IterationLimit => "iteration_limit",
            SolveStatus::TimeLimit => "time_limit",
            SolveStatus::NumericalError => "numerical_error",
            SolveStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Output of a rebalance call.
///
/// Always well formed: on failure `trades` and `post_trade_weights_estimate`
/// are empty and `error` explains why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceResult {
    pub trades: Vec<Trade>,
    pub post_trade_weights_estimate: Weights,
    pub status: SolveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal diagnostics (skipped buys, price fallbacks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RebalanceResult {
    /// A result carrying no trades and an error description.
    pub fn failed(status: SolveStatus, error: impl Into<String>) -> Self {
        Self {
            trades: Vec::new(),
            post_trade_weights_estimate: Weights::new(),
            status,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    /// A successful result with no trades.
    pub fn empty(post_trade_weights_estimate: Weights) -> Self {
        Self {
            trades: Vec::new(),
            post_trade_weights_estimate,
            status: SolveStatus::Optimal,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_optimal()
    }

    /// Total dollars traded.
    pub fn traded_volume(&self) -> f64 {
        self.trades.iter().map(|t| t.amount).sum()
    }
}

/// Broad asset class used by allocation caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equities,
    Bonds,
    Cash,
    Other,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetClass::Equities => write!(f, "equities"),
            AssetClass::Bonds => write!(f, "bonds"),
            AssetClass::Cash => write!(f, "cash"),
            AssetClass::Other => write!(f, "other"),
        }
    }
}

/// Supplies the asset class of a ticker.
pub trait AssetClassProvider {
    fn asset_class(&self, ticker: &str) -> Option<AssetClass>;
}

impl AssetClassProvider for BTreeMap<String, AssetClass> {
    fn asset_class(&self, ticker: &str) -> Option<AssetClass> {
        self.get(ticker).copied()
    }
}

impl AssetClassProvider for std::collections::HashMap<String, AssetClass> {
    fn asset_class(&self, ticker: &str) -> Option<AssetClass> {
        self.get(ticker).copied()
    }
}

/// Normalize a value map into weights; all zero when the total is not positive.
pub fn weights_from_values(values: &BTreeMap<String, f64>) -> Weights {
    let total: f64 = values.values().sum();
    values
        .iter()
        .map(|(t, v)| (t.clone(), if total > 0.0 { v / total } else { 0.0 }))
        .collect()
}
