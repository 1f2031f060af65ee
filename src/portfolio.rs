//! Portfolio state and position tracking.

use crate::error::{BalancerError, Result};
use crate::types::{weights_from_values, AssetPrices, Side, Trade, Weights, CASH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A single portfolio position.
///
/// Tradable assets carry a share count and a price; the cash position carries
/// a dollar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetPosition {
    Holding { amount: f64, price: f64 },
    Cash { value: f64 },
}

impl AssetPosition {
    /// Dollar value of the position.
    pub fn value(&self) -> f64 {
        match self {
            AssetPosition::Holding { amount, price } => amount * price,
            AssetPosition::Cash { value } => *value,
        }
    }

    pub fn is_cash(&self) -> bool {
        matches!(self, AssetPosition::Cash { .. })
    }

    /// Last known price (None for cash).
    pub fn price(&self) -> Option<f64> {
        match self {
            AssetPosition::Holding { price, .. } => Some(*price),
            AssetPosition::Cash { .. } => None,
        }
    }
}

/// Ticker → position mapping.
///
/// The `CASH` key, and only that key, holds a [`AssetPosition::Cash`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, AssetPosition>",
    into = "BTreeMap<String, AssetPosition>"
)]
pub struct Portfolio {
    positions: BTreeMap<String, AssetPosition>,
}

impl TryFrom<BTreeMap<String, AssetPosition>> for Portfolio {
    type Error = BalancerError;

    fn try_from(positions: BTreeMap<String, AssetPosition>) -> Result<Self> {
        let mut portfolio = Portfolio::new();
        for (ticker, position) in positions {
            portfolio.insert(ticker, position)?;
        }
        Ok(portfolio)
    }
}

impl From<Portfolio> for BTreeMap<String, AssetPosition> {
    fn from(portfolio: Portfolio) -> Self {
        portfolio.positions
    }
}

impl Portfolio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper adding a holding.
    ///
    /// # Panics
    ///
    /// Panics on a negative or non-finite amount or price, or on the `CASH`
    /// ticker. Use [`Portfolio::insert`] for fallible construction.
    pub fn with_holding(self, ticker: impl Into<String>, amount: f64, price: f64) -> Self {
        self.with_position(ticker.into(), AssetPosition::Holding { amount, price })
    }

    /// Builder-style helper setting the cash position.
    ///
    /// # Panics
    ///
    /// Panics on a non-finite value.
    pub fn with_cash(self, value: f64) -> Self {
        self.with_position(CASH.to_string(), AssetPosition::Cash { value })
    }

    fn with_position(mut self, ticker: String, position: AssetPosition) -> Self {
        if let Err(e) = self.insert(ticker, position) {
            panic!("{}", e);
        }
        self
    }

    /// Insert a position, enforcing the cash-key invariant.
    pub fn insert(&mut self, ticker: impl Into<String>, position: AssetPosition) -> Result<()> {
        let ticker = ticker.into();
        match (&position, ticker == CASH) {
            (AssetPosition::Cash { .. }, false) => {
                return Err(BalancerError::InvalidInput(format!(
                    "cash position must use the {} ticker, got {}",
                    CASH, ticker
                )))
            }
            (AssetPosition::Holding { .. }, true) => {
                return Err(BalancerError::InvalidInput(format!(
                    "{} must be a cash position with a value",
                    CASH
                )))
            }
            _ => {}
        }
        if let AssetPosition::Holding { amount, price } = position {
            if !amount.is_finite() || !price.is_finite() || amount < 0.0 || price < 0.0 {
                return Err(BalancerError::InvalidInput(format!(
                    "invalid holding for {}: amount={}, price={}",
                    ticker, amount, price
                )));
            }
        }
        if let AssetPosition::Cash { value } = position {
            if !value.is_finite() {
                return Err(BalancerError::InvalidInput(format!(
                    "non-finite cash value {}",
                    value
                )));
            }
        }
        self.positions.insert(ticker, position);
        Ok(())
    }

    pub fn get(&self, ticker: &str) -> Option<&AssetPosition> {
        self.positions.get(ticker)
    }

    pub fn positions(&self) -> &BTreeMap<String, AssetPosition> {
        &self.positions
    }

    pub fn tickers(&self) -> impl Iterator<Item = &String> {
        self.positions.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn has_cash(&self) -> bool {
        self.positions.contains_key(CASH)
    }

    /// Cash value (0 when there is no cash entry).
    pub fn cash(&self) -> f64 {
        self.positions.get(CASH).map(|p| p.value()).unwrap_or(0.0)
    }

    pub fn set_cash(&mut self, value: f64) {
        self.positions
            .insert(CASH.to_string(), AssetPosition::Cash { value });
    }

    fn adjust_cash(&mut self, delta: f64) {
        let cash = self.cash();
        self.set_cash(cash + delta);
    }

    /// Share count held for a ticker.
    pub fn shares(&self, ticker: &str) -> f64 {
        match self.positions.get(ticker) {
            Some(AssetPosition::Holding { amount, .. }) => *amount,
            _ => 0.0,
        }
    }

    /// Per-ticker dollar values.
    pub fn values(&self) -> BTreeMap<String, f64> {
        self.positions
            .iter()
            .map(|(t, p)| (t.clone(), p.value()))
            .collect()
    }

    /// Σ holdings `amount * price` + cash value.
    pub fn total_value(&self) -> f64 {
        self.positions.values().map(|p| p.value()).sum()
    }

    /// Actual weights by value.
    pub fn weights(&self) -> Weights {
        weights_from_values(&self.values())
    }

    /// Prices of all non-cash holdings.
    pub fn prices(&self) -> AssetPrices {
        self.positions
            .iter()
            .filter_map(|(t, p)| p.price().map(|price| (t.clone(), price)))
            .collect()
    }

    /// Mark a holding to a new price. Returns false if the ticker is not a holding.
    pub fn mark(&mut self, ticker: &str, new_price: f64) -> bool {
        match self.positions.get_mut(ticker) {
            Some(AssetPosition::Holding { price, .. }) => {
                *price = new_price;
                true
            }
            _ => false,
        }
    }

    /// Apply a dollar trade.
    ///
    /// Non-cash trades convert dollars to shares at `price` (or the holding's
    /// own price when `None`) and move `amount ± fee` through cash. Trades on
    /// `CASH` adjust the cash value directly.
    pub fn apply_trade(&mut self, trade: &Trade, price: Option<f64>, fee: f64) -> Result<()> {
        if trade.ticker == CASH {
            match trade.action {
                Side::Buy => self.adjust_cash(trade.amount),
                Side::Sell => self.adjust_cash(-trade.amount),
            }
            return Ok(());
        }

        let price = price
            .or_else(|| self.positions.get(&trade.ticker).and_then(|p| p.price()))
            .filter(|p| *p > 0.0 && p.is_finite())
            .ok_or_else(|| BalancerError::MissingPrice {
                ticker: trade.ticker.clone(),
            })?;

        let shares = trade.amount / price;
        let entry = self
            .positions
            .entry(trade.ticker.clone())
            .or_insert(AssetPosition::Holding { amount: 0.0, price });

        if let AssetPosition::Holding {
            amount,
            price: held_price,
        } = entry
        {
            *held_price = price;
            match trade.action {
                Side::Buy => *amount += shares,
                Side::Sell => *amount -= shares,
            }
            if *amount < 0.0 {
                if *amount > -1e-9 {
                    *amount = 0.0;
                } else {
                    warn!(
                        "Sell of {} left a negative share count ({:.6})",
                        trade.ticker, amount
                    );
                }
            }
        }

        match trade.action {
            Side::Buy => self.adjust_cash(-(trade.amount + fee)),
            Side::Sell => self.adjust_cash(trade.amount - fee),
        }
        debug!("Applied {} ({:.6} shares @ {:.4})", trade, shares, price);
        Ok(())
    }
}
