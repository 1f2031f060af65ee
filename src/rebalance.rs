//! Rule-based rebalancing toward target weights.
//!
//! The deterministic rebalancer never calls a solver: it computes dollar
//! deltas, sells first (largest first) to raise cash, then buys (smallest
//! first) as long as the cash reserve holds. Cash is the residual and is
//! never emitted as a trade.

use crate::error::{BalancerError, Result};
use crate::portfolio::Portfolio;
use crate::types::{
    weights_from_values, AssetPrices, RebalanceResult, SolveStatus, Trade, TradingParams, Weights,
    CASH,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Something that turns a portfolio and target weights into trades.
pub trait Rebalancer: Send + Sync {
    /// Short engine name used in logs and reports.
    fn name(&self) -> &str;

    fn rebalance(
        &self,
        portfolio: &Portfolio,
        target_weights: &Weights,
        total_value: f64,
        prices: &AssetPrices,
    ) -> Result<RebalanceResult>;
}

/// [`Rebalancer`] running [`rebalance_deterministic`].
#[derive(Debug, Clone, Default)]
pub struct DeterministicRebalancer {
    pub params: TradingParams,
}

impl DeterministicRebalancer {
    pub fn new(params: TradingParams) -> Self {
        Self { params }
    }
}

impl Rebalancer for DeterministicRebalancer {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn rebalance(
        &self,
        portfolio: &Portfolio,
        target_weights: &Weights,
        total_value: f64,
        prices: &AssetPrices,
    ) -> Result<RebalanceResult> {
        rebalance_deterministic(portfolio, target_weights, total_value, prices, &self.params)
    }
}

/// Reject non-finite or negative numbers in the rebalancer inputs.
pub(crate) fn validate_inputs(
    target_weights: &Weights,
    total_value: f64,
    prices: &AssetPrices,
    params: &TradingParams,
) -> Result<()> {
    if !total_value.is_finite() {
        return Err(BalancerError::InvalidInput(format!(
            "non-finite total value {}",
            total_value
        )));
    }
    for (ticker, w) in target_weights {
        if !w.is_finite() || *w < 0.0 {
            return Err(BalancerError::InvalidInput(format!(
                "invalid target weight {} for {}",
                w, ticker
            )));
        }
    }
    for (ticker, p) in prices {
        if !p.is_finite() || *p <= 0.0 {
            return Err(BalancerError::InvalidInput(format!(
                "invalid price {} for {}",
                p, ticker
            )));
        }
    }
    let numbers = [
        params.min_trade_threshold,
        params.min_cash_reserve,
        params.fees_per_trade,
    ];
    if numbers.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(BalancerError::InvalidInput(format!(
            "invalid trading parameters: {:?}",
            params
        )));
    }
    Ok(())
}

/// Sorted union of portfolio and target tickers.
pub(crate) fn ticker_universe(portfolio: &Portfolio, target_weights: &Weights) -> Vec<String> {
    portfolio
        .tickers()
        .chain(target_weights.keys())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Price used for share rounding: explicit price first, then the holding's.
fn rounding_price(ticker: &str, portfolio: &Portfolio, prices: &AssetPrices) -> Option<f64> {
    prices
        .get(ticker)
        .copied()
        .or_else(|| portfolio.get(ticker).and_then(|p| p.price()))
        .filter(|p| *p > 0.0)
}

/// Round a dollar amount to whole shares, at least one share.
fn round_to_shares(amount: f64, price: f64) -> f64 {
    let shares = (amount / price).round().max(1.0);
    shares * price
}

/// Rebalance toward `target_weights` with closed-form rules.
///
/// `total_value` scales the target weights into dollar targets. Trades below
/// `min_trade_threshold` are skipped, and a buy runs only while cash covers
/// its amount plus fee. A target that dips below `min_cash_reserve` clamps
/// the cash delta; ending below the reserve is reported as a warning.
pub fn rebalance_deterministic(
    portfolio: &Portfolio,
    target_weights: &Weights,
    total_value: f64,
    prices: &AssetPrices,
    params: &TradingParams,
) -> Result<RebalanceResult> {
    validate_inputs(target_weights, total_value, prices, params)?;

    let tickers = ticker_universe(portfolio, target_weights);
    let current = portfolio.values();

    if total_value <= 0.0 {
        debug!("Total value is {}, nothing to rebalance", total_value);
        return Ok(RebalanceResult::empty(
            tickers.into_iter().map(|t| (t, 0.0)).collect(),
        ));
    }

    let mut deltas: BTreeMap<String, f64> = tickers
        .iter()
        .map(|t| {
            let target = target_weights.get(t).copied().unwrap_or(0.0) * total_value;
            let held = current.get(t).copied().unwrap_or(0.0);
            (t.clone(), target - held)
        })
        .collect();

    let start_cash = portfolio.cash();
    let mut warnings = Vec::new();
    if let Some(cash_delta) = deltas.get_mut(CASH) {
        if *cash_delta < 0.0 && start_cash + *cash_delta < params.min_cash_reserve {
            let clamped = params.min_cash_reserve - start_cash;
            let msg = format!(
                "Target cash {:.2} is below reserve {:.2}; cash delta clamped from {:.2} to {:.2}",
                start_cash + *cash_delta,
                params.min_cash_reserve,
                cash_delta,
                clamped
            );
            debug!("{}", msg);
            warnings.push(msg);
            *cash_delta = clamped;
        }
    }

    let mut sells: Vec<(String, f64)> = deltas
        .iter()
        .filter(|(t, d)| t.as_str() != CASH && **d < 0.0)
        .map(|(t, d)| (t.clone(), -d))
        .collect();
    let mut buys: Vec<(String, f64)> = deltas
        .iter()
        .filter(|(t, d)| t.as_str() != CASH && **d > 0.0)
        .map(|(t, d)| (t.clone(), *d))
        .collect();
    // stable sorts keep ticker order on ties
    sells.sort_by(|a, b| b.1.total_cmp(&a.1));
    buys.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut trades = Vec::new();
    let mut post_values: BTreeMap<String, f64> = tickers
        .iter()
        .map(|t| (t.clone(), current.get(t).copied().unwrap_or(0.0)))
        .collect();
    let mut cash = start_cash;

    let sized = |ticker: &str, amount: f64, warnings: &mut Vec<String>| -> f64 {
        if !params.round_to_nearest_share {
            return amount;
        }
        match rounding_price(ticker, portfolio, prices) {
            Some(price) => round_to_shares(amount, price),
            None => {
                let msg = format!("No price for {}; trading unrounded amount", ticker);
                warn!("{}", msg);
                warnings.push(msg);
                amount
            }
        }
    };

    for (ticker, raw) in sells {
        if raw < params.min_trade_threshold {
            continue;
        }
        // rounding up must not sell more than is held
        let held = current.get(&ticker).copied().unwrap_or(0.0);
        let amount = sized(&ticker, raw, &mut warnings).min(held);
        if amount < params.min_trade_threshold {
            continue;
        }
        cash += amount - params.fees_per_trade;
        *post_values.entry(ticker.clone()).or_insert(0.0) -= amount;
        trades.push(Trade::sell(ticker, amount));
    }

    for (ticker, raw) in buys {
        if raw < params.min_trade_threshold {
            continue;
        }
        let amount = sized(&ticker, raw, &mut warnings);
        if amount < params.min_trade_threshold {
            continue;
        }
        if cash < amount + params.fees_per_trade {
            let msg = format!(
                "Skipped BUY {} ${:.2}: cash {:.2} cannot cover amount plus fee {:.2}",
                ticker, amount, cash, params.fees_per_trade
            );
            warn!("{}", msg);
            warnings.push(msg);
            continue;
        }
        cash -= amount + params.fees_per_trade;
        *post_values.entry(ticker.clone()).or_insert(0.0) += amount;
        trades.push(Trade::buy(ticker, amount));
    }

    if cash < params.min_cash_reserve {
        let msg = format!(
            "Cash {:.2} is below reserve {:.2} after trades",
            cash, params.min_cash_reserve
        );
        warn!("{}", msg);
        warnings.push(msg);
    }

    if portfolio.has_cash() || target_weights.contains_key(CASH) || cash != 0.0 {
        post_values.insert(CASH.to_string(), cash);
    }

    debug!(
        "Deterministic rebalance: {} trades, cash {:.2} -> {:.2}",
        trades.len(),
        start_cash,
        cash
    );

    Ok(RebalanceResult {
        trades,
        post_trade_weights_estimate: weights_from_values(&post_values),
        status: SolveStatus::Optimal,
        error: None,
        warnings,
    })
}
