//! Rebalancing as a convex quadratic program.
//!
//! Per ticker (sorted union of holdings and targets) the program carries a
//! post-trade weight `w`, a buy leg `b ≥ 0` and a sell leg `s ≥ 0`:
//!
//! ```text
//! minimize    Σb + Σs + λ‖w − target‖²
//! subject to  Σw = 1,  w ≥ 0
//!             current + b − s = w · V          (per ticker)
//!             w_cash · V ≥ min_cash_reserve    (if CASH is present)
//!             Σ buys + fees ≤ cash + Σ sells   (non-cash legs, fees relaxed)
//! ```
//!
//! The per-trade fee `fee × ceil(trade / threshold)` is not convex, so the
//! program uses `fee × trade / threshold` instead.

use crate::error::{BalancerError, Result};
use crate::portfolio::Portfolio;
use crate::qp::{ClarabelSolver, QpSolver, QuadraticProgram, SolverSettings};
use crate::rebalance::{ticker_universe, validate_inputs, Rebalancer};
use crate::types::{
    weights_from_values, AssetPrices, RebalanceResult, SolveStatus, Trade, TradingParams, Weights,
    CASH,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Parameters of the convex rebalancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvexParams {
    #[serde(default)]
    pub trading: TradingParams,
    /// Tolerated absolute deviation of any post-trade weight from its target.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Weight λ on the squared tracking error.
    #[serde(default = "default_tracking_penalty")]
    pub tracking_penalty: f64,
    #[serde(default)]
    pub solver: SolverSettings,
}

fn default_epsilon() -> f64 {
    0.01
}

fn default_tracking_penalty() -> f64 {
    1.0
}

impl Default for ConvexParams {
    fn default() -> Self {
        Self {
            trading: TradingParams::default(),
            epsilon: default_epsilon(),
            tracking_penalty: default_tracking_penalty(),
            solver: SolverSettings::default(),
        }
    }
}

/// Convex rebalancer over a pluggable [`QpSolver`].
#[derive(Debug, Clone)]
pub struct ConvexRebalancer<S: QpSolver = ClarabelSolver> {
    params: ConvexParams,
    solver: S,
}

impl ConvexRebalancer<ClarabelSolver> {
    pub fn new(params: ConvexParams) -> Self {
        let solver = ClarabelSolver::new(params.solver.clone());
        Self { params, solver }
    }
}

impl<S: QpSolver> ConvexRebalancer<S> {
    pub fn with_solver(params: ConvexParams, solver: S) -> Self {
        Self { params, solver }
    }

    pub fn params(&self) -> &ConvexParams {
        &self.params
    }

    /// Build the rebalancing program. Variable layout: `[w.., b.., s..]`.
    fn build_problem(
        &self,
        tickers: &[String],
        current: &BTreeMap<String, f64>,
        target_weights: &Weights,
        total_value: f64,
        cash: f64,
    ) -> QuadraticProgram {
        let n = tickers.len();
        let (w, b, s) = (0, n, 2 * n);
        let lambda = self.params.tracking_penalty;
        let trading = &self.params.trading;

        let mut qp = QuadraticProgram::new(3 * n);
        for (k, ticker) in tickers.iter().enumerate() {
            let target = target_weights.get(ticker).copied().unwrap_or(0.0);
            qp.add_quadratic(w + k, w + k, 2.0 * lambda);
            qp.set_linear(w + k, -2.0 * lambda * target);
            qp.set_linear(b + k, 1.0);
            qp.set_linear(s + k, 1.0);
        }

        qp.add_equality((0..n).map(|k| (w + k, 1.0)).collect(), 1.0);
        for (k, ticker) in tickers.iter().enumerate() {
            let held = current.get(ticker).copied().unwrap_or(0.0);
            qp.add_equality(
                vec![(b + k, 1.0), (s + k, -1.0), (w + k, -total_value)],
                -held,
            );
        }

        for i in 0..3 * n {
            qp.add_lower_bound(i, 0.0);
        }

        if let Some(cash_idx) = tickers.iter().position(|t| t == CASH) {
            qp.add_inequality(vec![(w + cash_idx, -total_value)], -trading.min_cash_reserve);

            let fee_rate = if trading.min_trade_threshold > 0.0 {
                trading.fees_per_trade / trading.min_trade_threshold
            } else {
                0.0
            };
            let budget: Vec<(usize, f64)> = (0..n)
                .filter(|&k| k != cash_idx)
                .flat_map(|k| [(b + k, 1.0 + fee_rate), (s + k, fee_rate - 1.0)])
                .collect();
            if !budget.is_empty() {
                qp.add_inequality(budget, cash);
            }
        }

        qp
    }
}

impl<S: QpSolver> Rebalancer for ConvexRebalancer<S> {
    fn name(&self) -> &str {
        "convex"
    }

    fn rebalance(
        &self,
        portfolio: &Portfolio,
        target_weights: &Weights,
        total_value: f64,
        prices: &AssetPrices,
    ) -> Result<RebalanceResult> {
        let params = &self.params;
        let trading = &params.trading;
        validate_inputs(target_weights, total_value, prices, trading)?;
        if !params.tracking_penalty.is_finite() || params.tracking_penalty <= 0.0 {
            return Err(BalancerError::InvalidInput(format!(
                "tracking penalty must be positive, got {}",
                params.tracking_penalty
            )));
        }

        let tickers = ticker_universe(portfolio, target_weights);
        if total_value <= 0.0 || tickers.is_empty() {
            debug!("Total value is {}, nothing to rebalance", total_value);
            return Ok(RebalanceResult::empty(
                tickers.into_iter().map(|t| (t, 0.0)).collect(),
            ));
        }

        let current = portfolio.values();
        let cash = portfolio.cash();
        let qp = self.build_problem(&tickers, &current, target_weights, total_value, cash);

        let solution = match self.solver.solve(&qp) {
            Ok(solution) => solution,
            Err(e) => {
                warn!("Convex rebalance solver error: {}", e);
                return Ok(RebalanceResult::failed(SolveStatus::Error, e.to_string()));
            }
        };
        if !solution.status.is_optimal() {
            warn!("Convex rebalance did not converge: {}", solution.status);
            return Ok(RebalanceResult::failed(
                solution.status,
                format!("solver finished with status {}", solution.status),
            ));
        }

        let n = tickers.len();
        if solution.x.len() != 3 * n {
            let msg = format!(
                "solver returned {} values for {} variables",
                solution.x.len(),
                3 * n
            );
            warn!("Convex rebalance: {}", msg);
            return Ok(RebalanceResult::failed(SolveStatus::Error, msg));
        }
        let x = &solution.x;
        let threshold = trading.min_trade_threshold;
        let leg = |v: f64| if v >= threshold { v } else { 0.0 };

        let mut trades = Vec::new();
        let mut post_values: BTreeMap<String, f64> = tickers
            .iter()
            .map(|t| (t.clone(), current.get(t).copied().unwrap_or(0.0)))
            .collect();
        let mut cash_after = cash;

        for (k, ticker) in tickers.iter().enumerate() {
            if ticker == CASH {
                continue;
            }
            let net = leg(x[n + k]) - leg(x[2 * n + k]);
            if net.abs() < threshold || net == 0.0 {
                continue;
            }
            let trade = if net > 0.0 {
                Trade::buy(ticker.clone(), net)
            } else {
                Trade::sell(ticker.clone(), -net)
            };
            *post_values.entry(ticker.clone()).or_insert(0.0) += trade.signed_amount();
            cash_after -= trade.signed_amount();
            trades.push(trade);
        }
        cash_after -= trades.len() as f64 * trading.fees_per_trade;

        if portfolio.has_cash() || target_weights.contains_key(CASH) || cash_after != 0.0 {
            post_values.insert(CASH.to_string(), cash_after);
        }

        let mut warnings = Vec::new();
        let max_dev = tickers
            .iter()
            .enumerate()
            .map(|(k, t)| (x[k] - target_weights.get(t).copied().unwrap_or(0.0)).abs())
            .fold(0.0_f64, f64::max);
        if max_dev > params.epsilon {
            let msg = format!(
                "Solved weights deviate from target by {:.4} (epsilon {:.4})",
                max_dev, params.epsilon
            );
            warn!("{}", msg);
            warnings.push(msg);
        }

        debug!(
            "Convex rebalance: {} trades, status {}, objective {:.4}",
            trades.len(),
            solution.status,
            solution.objective
        );

        Ok(RebalanceResult {
            trades,
            post_trade_weights_estimate: weights_from_values(&post_values),
            status: solution.status,
            error: None,
            warnings,
        })
    }
}

/// Rebalance toward `target_weights` by solving the convex program with Clarabel.
pub fn rebalance_convex(
    portfolio: &Portfolio,
    target_weights: &Weights,
    total_value: f64,
    prices: &AssetPrices,
    params: &ConvexParams,
) -> Result<RebalanceResult> {
    ConvexRebalancer::new(params.clone()).rebalance(portfolio, target_weights, total_value, prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qp::tests::FixedStatusSolver;
    use crate::types::Side;

    fn weights(pairs: &[(&str, f64)]) -> Weights {
        pairs.iter().map(|(t, w)| (t.to_string(), *w)).collect()
    }

    fn tight(threshold: f64) -> ConvexParams {
        ConvexParams {
            trading: TradingParams {
                min_trade_threshold: threshold,
                ..Default::default()
            },
            tracking_penalty: 1e6,
            ..Default::default()
        }
    }

    #[test]
    fn test_tight_tracking_sells_toward_target() {
        let p = Portfolio::new().with_holding("AAPL", 10.0, 100.0).with_cash(0.0);
        let target = weights(&[("AAPL", 0.5), (CASH, 0.5)]);
        let r = rebalance_convex(&p, &target, 1000.0, &AssetPrices::new(), &tight(1.0)).unwrap();

        assert!(r.is_success());
        assert_eq!(r.trades.len(), 1);
        assert_eq!(r.trades[0].action, Side::Sell);
        assert_eq!(r.trades[0].ticker, "AAPL");
        assert!((r.trades[0].amount - 500.0).abs() < 1.0);
        assert!((r.post_trade_weights_estimate[CASH] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_small_penalty_prefers_holding() {
        let p = Portfolio::new().with_holding("AAPL", 10.0, 100.0).with_cash(0.0);
        let target = weights(&[("AAPL", 0.5), (CASH, 0.5)]);
        let params = ConvexParams {
            trading: TradingParams {
                min_trade_threshold: 1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let r = rebalance_convex(&p, &target, 1000.0, &AssetPrices::new(), &params).unwrap();
        assert!(r.is_success());
        assert!(r.trades.is_empty());
        // far from target, so the deviation is reported
        assert!(!r.warnings.is_empty());
    }

    #[test]
    fn test_never_trades_cash() {
        let p = Portfolio::new()
            .with_holding("A", 2.0, 100.0)
            .with_holding("B", 8.0, 100.0)
            .with_cash(0.0);
        let target = weights(&[("A", 0.5), ("B", 0.5), (CASH, 0.0)]);
        let r = rebalance_convex(&p, &target, 1000.0, &AssetPrices::new(), &tight(1.0)).unwrap();
        assert!(r.is_success());
        assert!(r.trades.iter().all(|t| t.ticker != CASH));
        let buy_a = r.trades.iter().find(|t| t.ticker == "A").unwrap();
        assert_eq!(buy_a.action, Side::Buy);
        assert!((buy_a.amount - 300.0).abs() < 1.0);
    }

    #[test]
    fn test_cash_reserve_respected() {
        let p = Portfolio::new().with_holding("A", 0.0, 100.0).with_cash(1000.0);
        let target = weights(&[("A", 1.0), (CASH, 0.0)]);
        let mut params = tight(1.0);
        params.trading.min_cash_reserve = 200.0;
        let r = rebalance_convex(&p, &target, 1000.0, &AssetPrices::new(), &params).unwrap();
        assert!(r.is_success());
        assert!(r.post_trade_weights_estimate[CASH] >= 0.2 - 1e-4);
    }

    #[test]
    fn test_non_optimal_status_yields_failed_result() {
        let p = Portfolio::new().with_holding("A", 1.0, 100.0).with_cash(0.0);
        let target = weights(&[("A", 1.0)]);
        let rebalancer =
            ConvexRebalancer::with_solver(ConvexParams::default(), FixedStatusSolver(SolveStatus::Infeasible));
        let r = rebalancer.rebalance(&p, &target, 100.0, &AssetPrices::new()).unwrap();
        assert_eq!(r.status, SolveStatus::Infeasible);
        assert!(r.trades.is_empty());
        assert!(r.post_trade_weights_estimate.is_empty());
        assert!(r.error.is_some());
    }

    #[test]
    fn test_fees_deducted_from_cash() {
        let p = Portfolio::new().with_holding("A", 0.0, 100.0).with_cash(1000.0);
        let target = weights(&[("A", 0.5), (CASH, 0.5)]);
        let mut params = tight(10.0);
        params.trading.fees_per_trade = 5.0;
        let r = rebalance_convex(&p, &target, 1000.0, &AssetPrices::new(), &params).unwrap();

        assert!(r.is_success(), "{:?}", r.error);
        assert_eq!(r.trades.len(), 1);
        let buy = &r.trades[0];
        assert_eq!(buy.action, Side::Buy);
        assert!((buy.amount - 500.0).abs() < 1.0);
        // one fee leaves the book: 995 remains, of which 995 - buy is cash
        let expected_cash = (995.0 - buy.amount) / 995.0;
        assert!((r.post_trade_weights_estimate[CASH] - expected_cash).abs() < 1e-9);
        assert!(r.post_trade_weights_estimate[CASH] < 0.5);
    }

    #[test]
    fn test_fee_term_limits_buys_to_budget() {
        let p = Portfolio::new().with_holding("A", 0.0, 100.0).with_cash(300.0);
        let target = weights(&[("A", 1.0), (CASH, 0.0)]);
        let mut params = tight(10.0);
        // fee rate 1 per dollar: 2 * buy <= 300
        params.trading.fees_per_trade = 10.0;
        let r = rebalance_convex(&p, &target, 300.0, &AssetPrices::new(), &params).unwrap();

        assert!(r.is_success(), "{:?}", r.error);
        assert_eq!(r.trades.len(), 1);
        let buy = &r.trades[0];
        assert!(buy.amount <= 150.0 + 1e-3);
        assert!((buy.amount - 150.0).abs() < 1.0);
        assert!(r.post_trade_weights_estimate[CASH] >= 0.0);
        assert!(!r.warnings.is_empty());
    }

    struct ShortSolver;

    impl QpSolver for ShortSolver {
        fn solve(&self, _problem: &QuadraticProgram) -> Result<crate::qp::QpSolution> {
            Ok(crate::qp::QpSolution {
                x: vec![0.5; 2],
                status: SolveStatus::Optimal,
                objective: 0.0,
            })
        }
    }

    #[test]
    fn test_short_solution_yields_failed_result() {
        let p = Portfolio::new().with_holding("A", 1.0, 100.0).with_cash(0.0);
        let target = weights(&[("A", 1.0)]);
        let rebalancer = ConvexRebalancer::with_solver(ConvexParams::default(), ShortSolver);
        let r = rebalancer.rebalance(&p, &target, 100.0, &AssetPrices::new()).unwrap();
        assert_eq!(r.status, SolveStatus::Error);
        assert!(r.trades.is_empty());
        assert!(r.error.unwrap().contains("2 values for 6 variables"));
    }

    #[test]
    fn test_zero_total_value() {
        let p = Portfolio::new().with_cash(0.0);
        let target = weights(&[("A", 1.0)]);
        let r = rebalance_convex(&p, &target, 0.0, &AssetPrices::new(), &ConvexParams::default()).unwrap();
        assert!(r.trades.is_empty());
        assert!(r.post_trade_weights_estimate.values().all(|w| *w == 0.0));
    }

    #[test]
    fn test_rejects_non_positive_penalty() {
        let p = Portfolio::new().with_cash(100.0);
        let mut params = ConvexParams::default();
        params.tracking_penalty = 0.0;
        assert!(rebalance_convex(&p, &Weights::new(), 100.0, &AssetPrices::new(), &params).is_err());
    }

    #[test]
    fn test_problem_layout() {
        let rebalancer = ConvexRebalancer::new(ConvexParams::default());
        let tickers = vec!["A".to_string(), CASH.to_string()];
        let current: BTreeMap<String, f64> =
            [("A".to_string(), 50.0), (CASH.to_string(), 50.0)].into_iter().collect();
        let qp = rebalancer.build_problem(&tickers, &current, &weights(&[("A", 1.0)]), 100.0, 50.0);
        assert_eq!(qp.num_vars(), 6);
        // sum + 2 balance rows
        assert_eq!(qp.equalities().len(), 3);
        // 6 bounds + reserve + budget
        assert_eq!(qp.inequalities().len(), 8);
    }
}
