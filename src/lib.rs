//! Portfolio Balancer - portfolio rebalancing and strategy evaluation.
//!
//! # Overview
//!
//! The crate moves a portfolio toward target asset weights and evaluates
//! rebalancing strategies against historical prices:
//!
//! - **Deterministic rebalancer**: closed-form sells-then-buys with trade
//!   thresholds, cash reserve, fees and whole-share rounding
//! - **Convex rebalancer**: a quadratic program trading tracking error against
//!   turnover, solved with Clarabel
//! - **Mean-variance optimizer**: long-only minimum-variance weights with
//!   asset-class caps and an optional target return
//! - **Backtest simulator**: monthly, quarterly or drift-triggered rebalancing
//!   over a price history, with CAGR, Sharpe, drawdown and turnover
//! - **Recommendations**: concentration, volatility and correlation advice
//! - **Configuration files**: TOML-based configuration for reproducible runs
//!
//! # Quick Start
//!
//! ```
//! use portfolio_balancer::portfolio::Portfolio;
//! use portfolio_balancer::rebalance::rebalance_deterministic;
//! use portfolio_balancer::types::{TradingParams, Weights, CASH};
//!
//! let portfolio = Portfolio::new()
//!     .with_holding("AAPL", 10.0, 100.0)
//!     .with_cash(0.0);
//! let targets: Weights = [("AAPL".to_string(), 0.5), (CASH.to_string(), 0.5)]
//!     .into_iter()
//!     .collect();
//! let params = TradingParams {
//!     min_trade_threshold: 1.0,
//!     ..Default::default()
//! };
//!
//! let result = rebalance_deterministic(
//!     &portfolio,
//!     &targets,
//!     portfolio.total_value(),
//!     &portfolio.prices(),
//!     &params,
//! )
//! .unwrap();
//! assert_eq!(result.trades.len(), 1);
//! println!("{}", result.trades[0]);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Trades, weights, solve status and rebalance results
//! - [`portfolio`]: Holdings and cash positions
//! - [`data`]: Price histories and CSV loading
//! - [`analytics`]: Returns, covariance, risk and performance metrics
//! - [`qp`]: Quadratic-program builder and solver backends
//! - [`rebalance`]: Rebalancer trait and the deterministic rebalancer
//! - [`convex`]: Optimization-based rebalancer
//! - [`mvo`]: Mean-variance optimizer
//! - [`engine`]: Backtest simulator and strategy comparison
//! - [`recommend`]: Rule-based portfolio advice
//! - [`config`]: TOML configuration file support

pub mod analytics;
pub mod config;
pub mod convex;
pub mod data;
pub mod engine;
pub mod error;
pub mod mvo;
pub mod portfolio;
pub mod qp;
pub mod rebalance;
pub mod recommend;
pub mod types;

// Re-exports for convenience
pub use analytics::{
    covariance, daily_returns, risk_metrics, BacktestReport, CovarianceMatrix, PerformanceMetrics,
    Returns, ResultFormatter, RiskMetrics,
};
pub use config::BalancerFileConfig;
pub use convex::{rebalance_convex, ConvexParams, ConvexRebalancer};
pub use data::{load_price_csv, PriceCsvConfig, PriceHistory, PriceHistoryProvider};
pub use engine::{
    compare_strategies, run_backtest, BacktestConfig, BacktestResult, Backtester, RebalanceEngine,
    RebalancePolicy,
};
pub use error::{BalancerError, Result};
pub use mvo::{optimize_mvo, MeanVarianceOptimizer, MvoConstraints, MvoResult};
pub use portfolio::{AssetPosition, Portfolio};
pub use qp::{ClarabelSolver, QpSolution, QpSolver, QuadraticProgram, SolverSettings};
pub use rebalance::{rebalance_deterministic, DeterministicRebalancer, Rebalancer};
pub use recommend::{generate_recommendations, Recommendation};
pub use types::{
    AssetClass, AssetClassProvider, AssetPrices, DatedTrade, RebalanceResult, Side, SolveStatus,
    Trade, TradingParams, Weights, CASH,
};
