//! Integration tests for the rebalancing engine.

use chrono::NaiveDate;
use portfolio_balancer::analytics::{risk_metrics, BacktestReport, ResultFormatter};
use portfolio_balancer::config::BalancerFileConfig;
use portfolio_balancer::data::{load_price_csv, PriceCsvConfig, PriceHistory};
use portfolio_balancer::engine::{
    compare_strategies, run_backtest, BacktestConfig, RebalanceEngine, RebalancePolicy,
};
use portfolio_balancer::mvo::{optimize_mvo, MvoConstraints};
use portfolio_balancer::portfolio::Portfolio;
use portfolio_balancer::rebalance::{rebalance_deterministic, DeterministicRebalancer, Rebalancer};
use portfolio_balancer::recommend::{generate_recommendations, Recommendation};
use portfolio_balancer::types::{AssetClass, Side, TradingParams, Weights, CASH};
use portfolio_balancer::{rebalance_convex, ConvexParams};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use tempfile::NamedTempFile;

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
}

/// Deterministic trending price with a periodic wiggle.
fn synthetic_series(days: usize, base: f64, drift: f64, amp: f64, freq: f64) -> Vec<f64> {
    (0..days)
        .map(|i| {
            let t = i as f64;
            base * (drift * t + amp * (freq * t).sin()).exp()
        })
        .collect()
}

/// Three assets: a strong riser, a slow riser and a quiet bond-like series.
fn create_synthetic_history(days: usize) -> PriceHistory {
    let dates = (0..days)
        .map(|i| start_date() + chrono::Duration::days(i as i64))
        .collect();
    let mut series = BTreeMap::new();
    series.insert("AAA".to_string(), synthetic_series(days, 100.0, 0.002, 0.02, 0.7));
    series.insert("BBB".to_string(), synthetic_series(days, 50.0, 0.0005, 0.015, 1.3));
    series.insert("CCC".to_string(), synthetic_series(days, 20.0, 0.0002, 0.005, 0.4));
    PriceHistory::from_series(dates, series).unwrap()
}

fn initial_portfolio(history: &PriceHistory) -> Portfolio {
    Portfolio::new()
        .with_holding("AAA", 50.0, history.price(0, "AAA").unwrap())
        .with_holding("BBB", 100.0, history.price(0, "BBB").unwrap())
        .with_holding("CCC", 250.0, history.price(0, "CCC").unwrap())
        .with_cash(1_000.0)
}

fn targets() -> Weights {
    [("AAA", 0.4), ("BBB", 0.3), ("CCC", 0.25), (CASH, 0.05)]
        .iter()
        .map(|(t, w)| (t.to_string(), *w))
        .collect()
}

fn assert_no_ticker_on_both_sides(trades: &[(NaiveDate, String, Side)]) {
    let mut seen: BTreeMap<(NaiveDate, String), HashSet<Side>> = BTreeMap::new();
    for (date, ticker, side) in trades {
        seen.entry((*date, ticker.clone()))
            .or_default()
            .insert(*side);
    }
    for ((date, ticker), sides) in seen {
        assert_eq!(sides.len(), 1, "{} traded both ways on {}", ticker, date);
    }
}

#[test]
fn test_rebalance_then_apply_reaches_targets() {
    let mut portfolio = Portfolio::new().with_holding("AAPL", 10.0, 100.0).with_cash(0.0);
    let target: Weights = [("AAPL".to_string(), 0.5), (CASH.to_string(), 0.5)]
        .into_iter()
        .collect();
    let params = TradingParams {
        min_trade_threshold: 1.0,
        ..Default::default()
    };

    let result = rebalance_deterministic(
        &portfolio,
        &target,
        portfolio.total_value(),
        &portfolio.prices(),
        &params,
    )
    .unwrap();
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].action, Side::Sell);
    assert!((result.trades[0].amount - 500.0).abs() < 1e-9);

    for trade in &result.trades {
        portfolio.apply_trade(trade, None, 0.0).unwrap();
    }
    let weights = portfolio.weights();
    assert!((weights["AAPL"] - 0.5).abs() < 1e-9);
    assert!((weights[CASH] - 0.5).abs() < 1e-9);
    assert!((portfolio.total_value() - 1000.0).abs() < 1e-9);
}

#[test]
fn test_deterministic_and_convex_agree_on_direction() {
    let portfolio = Portfolio::new()
        .with_holding("AAA", 10.0, 100.0)
        .with_holding("BBB", 10.0, 50.0)
        .with_cash(500.0);
    let target: Weights = [("AAA", 0.3), ("BBB", 0.5), (CASH, 0.2)]
        .iter()
        .map(|(t, w)| (t.to_string(), *w))
        .collect();
    let total = portfolio.total_value();
    let prices = portfolio.prices();

    let deterministic = DeterministicRebalancer::default()
        .rebalance(&portfolio, &target, total, &prices)
        .unwrap();
    let convex = rebalance_convex(
        &portfolio,
        &target,
        total,
        &prices,
        &ConvexParams {
            tracking_penalty: 1e6,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(convex.is_success(), "{:?}", convex.error);

    for result in [&deterministic, &convex] {
        let side = |ticker: &str| {
            result
                .trades
                .iter()
                .find(|t| t.ticker == ticker)
                .map(|t| t.action)
        };
        assert_eq!(side("AAA"), Some(Side::Sell));
        assert_eq!(side("BBB"), Some(Side::Buy));
        assert!(result.trades.iter().all(|t| t.ticker != CASH));
        for (ticker, w) in &target {
            let estimate = result.post_trade_weights_estimate[ticker];
            assert!((estimate - w).abs() < 0.02, "{} estimate {}", ticker, estimate);
        }
    }
}

#[test]
fn test_quarterly_deterministic_backtest() {
    let history = create_synthetic_history(300);
    let portfolio = initial_portfolio(&history);
    let config = BacktestConfig::default();

    let result = run_backtest(&history, &portfolio, &targets(), &config).unwrap();

    assert_eq!(result.label, "deterministic");
    assert_eq!(result.value_history.len(), 300);
    assert!((result.initial_value() - portfolio.total_value()).abs() < 1e-6);
    assert_eq!(
        result.rebalance_dates,
        vec![
            NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 7, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 10, 1).unwrap(),
        ]
    );
    assert_eq!(result.skipped_rebalances, 0);
    assert!(!result.trades_history.is_empty());
    assert!(result
        .trades_history
        .iter()
        .all(|t| t.trade.amount >= config.trading.min_trade_threshold));
    assert!(result.trades_history.iter().all(|t| result.rebalance_dates.contains(&t.date)));

    let m = &result.metrics;
    assert!(m.cagr.is_finite());
    assert!(m.sharpe_ratio.is_finite());
    assert!((-1.0..=0.0).contains(&m.max_drawdown));
    assert!(m.turnover > 0.0);
    assert!(result.values().iter().all(|v| *v > 0.0));
}

#[test]
fn test_drift_convex_backtest() {
    let history = create_synthetic_history(200);
    let portfolio = initial_portfolio(&history);
    let mut config = BacktestConfig {
        policy: RebalancePolicy::Drift { threshold: 0.05 },
        engine: RebalanceEngine::Convex,
        ..Default::default()
    };
    config.convex.tracking_penalty = 1e6;
    config.trading.min_trade_threshold = 1.0;

    let result = run_backtest(&history, &portfolio, &targets(), &config).unwrap();

    assert_eq!(result.label, "convex");
    assert_eq!(result.value_history.len(), 200);
    assert!(!result.rebalance_dates.is_empty());
    assert!(result.trades_history.iter().all(|t| t.trade.amount >= 1.0));
    let legs: Vec<(NaiveDate, String, Side)> = result
        .trades_history
        .iter()
        .map(|t| (t.date, t.trade.ticker.clone(), t.trade.action))
        .collect();
    assert_no_ticker_on_both_sides(&legs);
}

#[test]
fn test_monthly_mvo_backtest() {
    let history = create_synthetic_history(300);
    let portfolio = initial_portfolio(&history);
    let mut config = BacktestConfig {
        policy: RebalancePolicy::Monthly,
        engine: RebalanceEngine::Mvo,
        ..Default::default()
    };
    config.mvo.lookback_days = 120;

    let result = run_backtest(&history, &portfolio, &targets(), &config).unwrap();

    assert_eq!(result.label, "mvo");
    // Feb through Oct.
    assert_eq!(result.rebalance_dates.len(), 9);
    assert!(result.skipped_rebalances <= result.rebalance_dates.len());
    assert!(result.values().iter().all(|v| v.is_finite() && *v > 0.0));
    assert!(result.trades_history.iter().all(|t| t.trade.ticker != CASH));
}

#[test]
fn test_mvo_respects_class_caps() {
    let history = create_synthetic_history(250);
    let mut asset_classes = BTreeMap::new();
    asset_classes.insert("AAA".to_string(), AssetClass::Equities);
    asset_classes.insert("BBB".to_string(), AssetClass::Equities);
    asset_classes.insert("CCC".to_string(), AssetClass::Bonds);
    let constraints = MvoConstraints {
        max_equities_weight: Some(0.5),
        asset_classes,
        ..Default::default()
    };

    let result = optimize_mvo(&history, 0.01, &constraints).unwrap();
    assert!(result.is_success(), "{:?}", result.message);

    let sum: f64 = result.optimal_weights.values().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    assert!(result.optimal_weights.values().all(|w| *w >= -1e-9));
    let equities = result.optimal_weights["AAA"] + result.optimal_weights["BBB"];
    assert!(equities <= 0.5 + 1e-6, "equities weight {}", equities);
    assert!(result.expected_volatility >= 0.0);
}

#[test]
fn test_risk_metrics_and_recommendations() {
    let history = create_synthetic_history(120);
    let portfolio = initial_portfolio(&history);

    let metrics = risk_metrics(&history, &[0.4, 0.3, 0.3], 0.01).unwrap();
    assert!(metrics.volatility > 0.0);
    assert_eq!(metrics.risk_score, metrics.volatility);
    assert!(metrics.sharpe_ratio.is_finite());
    assert!(risk_metrics(&history, &[0.5, 0.5], 0.01).is_err());

    let advice = generate_recommendations(&portfolio.weights(), 0.0, &history).unwrap();
    assert!(advice
        .iter()
        .any(|a| matches!(a, Recommendation::ReduceVolatility { .. })));
    assert!(advice.iter().all(|a| !a.to_string().is_empty()));
}

#[test]
fn test_compare_strategies_from_config_files() {
    let history = create_synthetic_history(200);

    let mut csv_file = NamedTempFile::new().unwrap();
    writeln!(csv_file, "date,AAA,BBB,CCC").unwrap();
    for (i, date) in history.dates().iter().enumerate() {
        writeln!(
            csv_file,
            "{},{:.6},{:.6},{:.6}",
            date.format("%Y-%m-%d"),
            history.price(i, "AAA").unwrap(),
            history.price(i, "BBB").unwrap(),
            history.price(i, "CCC").unwrap()
        )
        .unwrap();
    }

    let toml_content = format!(
        r#"
[data]
path = "{}"

[backtest]
policy = "monthly"
engine = "deterministic"

[convex]
tracking_penalty = 1000000.0

[mvo]
lookback_days = 90

[portfolio]
AAA = {{ amount = 50.0, price = 100.0 }}
BBB = {{ amount = 100.0, price = 50.0 }}
CASH = {{ value = 2000.0 }}

[targets]
AAA = 0.5
BBB = 0.3
CCC = 0.15
CASH = 0.05

[baseline]
AAA = 0.6
BBB = 0.4
"#,
        csv_file.path().display()
    );
    let mut config_file = NamedTempFile::new().unwrap();
    config_file.write_all(toml_content.as_bytes()).unwrap();

    let file_config = BalancerFileConfig::load(config_file.path()).unwrap();
    let data_path = file_config.data.path.clone().unwrap();
    let loaded = load_price_csv(&data_path, &PriceCsvConfig::default()).unwrap();
    assert_eq!(loaded.len(), 200);
    assert_eq!(loaded.tickers(), history.tickers());

    let results = compare_strategies(
        &loaded,
        &file_config.portfolio,
        &file_config.targets,
        &file_config.baseline,
        &file_config.to_backtest_config().unwrap(),
    )
    .unwrap();

    let labels: Vec<&str> = results.keys().map(|s| s.as_str()).collect();
    assert_eq!(labels, vec!["baseline", "convex", "deterministic", "mvo"]);
    for result in results.values() {
        assert_eq!(result.value_history.len(), 200);
        assert!((result.initial_value() - 12_000.0).abs() < 1.0);
    }
    // The baseline starts fully invested at first-date prices.
    assert!(results["baseline"].rebalance_dates.len() <= 2);

    let report = BacktestReport::from_results(&results);
    assert_eq!(report.summary_metrics.len(), 4);
    assert!(report.best_by_sharpe().is_some());
    let table = ResultFormatter::metrics_table(&report);
    for label in labels {
        assert!(table.contains(label));
    }
}
