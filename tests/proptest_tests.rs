//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that:
//! 1. Rebalance outputs respect the trade threshold and never trade cash
//! 2. No ticker is bought and sold in the same rebalance
//! 3. Applying the trades conserves value up to fees and reports a breached cash reserve
//! 4. Successful optimizations return fully invested long-only weights

use chrono::NaiveDate;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

use portfolio_balancer::analytics::{cagr, max_drawdown};
use portfolio_balancer::data::PriceHistory;
use portfolio_balancer::mvo::{optimize_mvo, MvoConstraints};
use portfolio_balancer::portfolio::Portfolio;
use portfolio_balancer::rebalance::rebalance_deterministic;
use portfolio_balancer::types::{weights_from_values, TradingParams, Weights, CASH};

// ============================================================================
// Generators
// ============================================================================

/// Holdings as (shares, price) pairs plus a cash balance.
fn portfolio_strategy() -> impl Strategy<Value = (Vec<(f64, f64)>, f64)> {
    (
        prop::collection::vec((0.0..1_000.0f64, 1.0..500.0f64), 1..5),
        0.0..10_000.0f64,
    )
}

fn build_portfolio(holdings: &[(f64, f64)], cash: f64) -> Portfolio {
    holdings
        .iter()
        .enumerate()
        .fold(Portfolio::new().with_cash(cash), |p, (i, (amount, price))| {
            p.with_holding(format!("T{}", i), *amount, *price)
        })
}

/// Normalized targets over `T0..Tn` and `CASH`.
fn build_targets(raw: &[f64], n: usize) -> Option<Weights> {
    let raw = &raw[..=n.min(raw.len() - 1)];
    let sum: f64 = raw.iter().sum();
    if sum <= 1e-9 {
        return None;
    }
    let mut targets = Weights::new();
    for (i, w) in raw.iter().enumerate() {
        let ticker = if i == raw.len() - 1 {
            CASH.to_string()
        } else {
            format!("T{}", i)
        };
        targets.insert(ticker, w / sum);
    }
    Some(targets)
}

fn params_strategy() -> impl Strategy<Value = TradingParams> {
    (0.01..50.0f64, 0.0..1.0f64, 0.0..2_000.0f64, any::<bool>()).prop_map(
        |(threshold, fee_share, reserve, round)| TradingParams {
            min_trade_threshold: threshold,
            // fees never exceed the smallest tradable amount
            fees_per_trade: threshold * fee_share,
            min_cash_reserve: reserve,
            round_to_nearest_share: round,
        },
    )
}

// ============================================================================
// Deterministic Rebalancer Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_trades_respect_threshold_and_sides(
        (holdings, cash) in portfolio_strategy(),
        raw in prop::collection::vec(0.0..1.0f64, 6),
        params in params_strategy(),
    ) {
        let portfolio = build_portfolio(&holdings, cash);
        let targets = build_targets(&raw, holdings.len());
        prop_assume!(targets.is_some());
        let targets = targets.unwrap();

        let result = rebalance_deterministic(
            &portfolio,
            &targets,
            portfolio.total_value(),
            &portfolio.prices(),
            &params,
        ).unwrap();

        prop_assert!(result.is_success());
        let mut seen = HashSet::new();
        for trade in &result.trades {
            prop_assert!(trade.amount >= params.min_trade_threshold);
            prop_assert_ne!(trade.ticker.as_str(), CASH);
            prop_assert!(seen.insert(trade.ticker.clone()), "{} traded twice", trade.ticker);
        }

        let estimate_sum: f64 = result.post_trade_weights_estimate.values().sum();
        prop_assert!((estimate_sum - 1.0).abs() < 1e-6 || estimate_sum == 0.0);
    }

    #[test]
    fn prop_applied_trades_conserve_value(
        (holdings, cash) in portfolio_strategy(),
        raw in prop::collection::vec(0.0..1.0f64, 6),
        params in params_strategy(),
    ) {
        let mut portfolio = build_portfolio(&holdings, cash);
        let targets = build_targets(&raw, holdings.len());
        prop_assume!(targets.is_some());
        let targets = targets.unwrap();

        let before = portfolio.total_value();
        let prices = portfolio.prices();
        let result = rebalance_deterministic(&portfolio, &targets, before, &prices, &params).unwrap();

        for trade in &result.trades {
            portfolio
                .apply_trade(trade, prices.get(&trade.ticker).copied(), params.fees_per_trade)
                .unwrap();
        }

        let fees = result.trades.len() as f64 * params.fees_per_trade;
        let after = portfolio.total_value();
        prop_assert!((before - fees - after).abs() <= 1e-6 * before.max(1.0));

        // buys need amount plus fee in hand, so cash never goes negative
        prop_assert!(portfolio.cash() >= -1e-6);
        if portfolio.cash() < params.min_cash_reserve - 1e-6 {
            prop_assert!(result.warnings.iter().any(|w| w.contains("below reserve")));
        }
        for (ticker, value) in portfolio.values() {
            if ticker != CASH {
                prop_assert!(value >= -1e-6, "{} went negative: {}", ticker, value);
            }
        }
    }

    #[test]
    fn prop_below_threshold_drift_trades_nothing(
        (holdings, cash) in portfolio_strategy(),
    ) {
        let portfolio = build_portfolio(&holdings, cash);
        let total = portfolio.total_value();
        prop_assume!(total > 0.0);

        // Current weights as targets: every delta is zero.
        let params = TradingParams::default();
        let result = rebalance_deterministic(
            &portfolio,
            &portfolio.weights(),
            total,
            &portfolio.prices(),
            &params,
        ).unwrap();
        prop_assert!(result.trades.is_empty());
    }
}

// ============================================================================
// Statistics Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_weights_from_values_normalize(
        values in prop::collection::vec(0.0..1e6f64, 1..8),
    ) {
        let map: BTreeMap<String, f64> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("T{}", i), *v))
            .collect();
        let weights = weights_from_values(&map);
        let sum: f64 = weights.values().sum();
        if values.iter().sum::<f64>() > 0.0 {
            prop_assert!((sum - 1.0).abs() < 1e-9);
        } else {
            prop_assert_eq!(sum, 0.0);
        }
    }

    #[test]
    fn prop_drawdown_bounded(
        values in prop::collection::vec(1.0..1e5f64, 2..100),
    ) {
        let dd = max_drawdown(&values);
        prop_assert!((-1.0..=0.0).contains(&dd));
        prop_assert!(cagr(&values) >= -1.0);
    }
}

// ============================================================================
// Mean-Variance Optimizer Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_mvo_weights_fully_invested(
        returns in prop::collection::vec(
            prop::collection::vec(-0.05..0.05f64, 40),
            2..5,
        ),
    ) {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dates = (0..=40).map(|i| start + chrono::Duration::days(i)).collect();
        let series: BTreeMap<String, Vec<f64>> = returns
            .iter()
            .enumerate()
            .map(|(i, rets)| {
                let mut prices = vec![100.0];
                for r in rets {
                    let last = prices[prices.len() - 1];
                    prices.push(last * (1.0 + r));
                }
                (format!("T{}", i), prices)
            })
            .collect();
        let history = PriceHistory::from_series(dates, series).unwrap();

        let result = optimize_mvo(&history, 0.01, &MvoConstraints::default()).unwrap();
        if result.is_success() {
            let sum: f64 = result.optimal_weights.values().sum();
            prop_assert!((sum - 1.0).abs() < 1e-6);
            prop_assert!(result.optimal_weights.values().all(|w| *w >= -1e-9));
            prop_assert!(result.expected_volatility >= 0.0);
        }
    }
}
