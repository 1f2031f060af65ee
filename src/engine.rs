//! Backtest simulation over a price history.
//!
//! A run walks the trading dates in order. Each date marks holdings to the
//! day's prices, evaluates the rebalance trigger and, when it fires, asks the
//! configured engine for trades and applies them. The simulation state is a
//! value threaded through [`Backtester::step`].

use crate::analytics::PerformanceMetrics;
use crate::convex::{ConvexParams, ConvexRebalancer};
use crate::data::PriceHistory;
use crate::error::{BalancerError, Result};
use crate::mvo::{MeanVarianceOptimizer, MvoConstraints};
use crate::portfolio::{AssetPosition, Portfolio};
use crate::qp::SolverSettings;
use crate::rebalance::{rebalance_deterministic, Rebalancer};
use crate::types::{AssetPrices, DatedTrade, RebalanceResult, Trade, TradingParams, Weights, CASH};
use chrono::{Datelike, Duration, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// When to rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebalancePolicy {
    /// Calendar month changed since the last rebalance.
    Monthly,
    /// At least three calendar months since the last rebalance.
    #[default]
    Quarterly,
    /// Some target weight drifted by more than `threshold` (relative).
    Drift { threshold: f64 },
}

impl fmt::Display for RebalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalancePolicy::Monthly => write!(f, "monthly"),
            RebalancePolicy::Quarterly => write!(f, "quarterly"),
            RebalancePolicy::Drift { threshold } => write!(f, "drift({:.1}%)", threshold * 100.0),
        }
    }
}

/// Which engine produces the trades on a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceEngine {
    #[default]
    Deterministic,
    Convex,
    /// Mean-variance weights executed by the deterministic rebalancer.
    Mvo,
}

impl fmt::Display for RebalanceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceEngine::Deterministic => write!(f, "deterministic"),
            RebalanceEngine::Convex => write!(f, "convex"),
            RebalanceEngine::Mvo => write!(f, "mvo"),
        }
    }
}

/// Mean-variance settings for the `mvo` engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvoStepConfig {
    #[serde(default)]
    pub constraints: MvoConstraints,
    /// Trailing window of calendar days fed to the optimizer.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

fn default_lookback_days() -> i64 {
    365 * 5
}

impl Default for MvoStepConfig {
    fn default() -> Self {
        Self {
            constraints: MvoConstraints::default(),
            lookback_days: default_lookback_days(),
        }
    }
}

/// Configuration for a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default)]
    pub policy: RebalancePolicy,
    #[serde(default)]
    pub engine: RebalanceEngine,
    #[serde(default = "default_backtest_trading")]
    pub trading: TradingParams,
    /// Convex engine settings; its `trading` and `solver` are taken from
    /// this config.
    #[serde(default)]
    pub convex: ConvexParams,
    #[serde(default)]
    pub mvo: MvoStepConfig,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub solver: SolverSettings,
}

fn default_backtest_trading() -> TradingParams {
    TradingParams {
        round_to_nearest_share: true,
        ..TradingParams::default()
    }
}

pub(crate) fn default_risk_free_rate() -> f64 {
    0.01
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            policy: RebalancePolicy::default(),
            engine: RebalanceEngine::default(),
            trading: default_backtest_trading(),
            convex: ConvexParams::default(),
            mvo: MvoStepConfig::default(),
            risk_free_rate: default_risk_free_rate(),
            solver: SolverSettings::default(),
        }
    }
}

/// Portfolio value at the end of a trading date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Output of a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub label: String,
    pub engine: RebalanceEngine,
    pub value_history: Vec<ValuePoint>,
    pub trades_history: Vec<DatedTrade>,
    pub metrics: PerformanceMetrics,
    /// Dates on which the trigger fired.
    pub rebalance_dates: Vec<NaiveDate>,
    /// Triggers where the engine produced nothing usable.
    pub skipped_rebalances: usize,
}

impl BacktestResult {
    pub fn initial_value(&self) -> f64 {
        self.value_history.first().map(|p| p.value).unwrap_or(0.0)
    }

    pub fn final_value(&self) -> f64 {
        self.value_history.last().map(|p| p.value).unwrap_or(0.0)
    }

    pub fn values(&self) -> Vec<f64> {
        self.value_history.iter().map(|p| p.value).collect()
    }
}

/// Mutable state of a run, moved through each step.
#[derive(Debug, Clone)]
pub struct SimulationState {
    pub portfolio: Portfolio,
    pub last_rebalance: NaiveDate,
    /// Last observed price per ticker.
    pub last_prices: AssetPrices,
}

/// What happened on one date.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub value: f64,
    pub trades: Vec<Trade>,
    pub rebalanced: bool,
    pub skipped: bool,
}

fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}

/// Backtest runner for one configuration.
pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run over all dates of `history`, labelled with the engine name.
    pub fn run(
        &self,
        history: &PriceHistory,
        initial: &Portfolio,
        target_weights: &Weights,
    ) -> Result<BacktestResult> {
        self.run_labeled(&self.config.engine.to_string(), history, initial, target_weights)
    }

    pub fn run_labeled(
        &self,
        label: &str,
        history: &PriceHistory,
        initial: &Portfolio,
        target_weights: &Weights,
    ) -> Result<BacktestResult> {
        if history.is_empty() {
            return Err(BalancerError::InsufficientData(
                "price history has no dates".to_string(),
            ));
        }
        if let Some((ticker, w)) = target_weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(BalancerError::InvalidInput(format!(
                "invalid target weight {} for {}",
                w, ticker
            )));
        }
        if let RebalancePolicy::Drift { threshold } = self.config.policy {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(BalancerError::ConfigError(format!(
                    "drift threshold must be non-negative, got {}",
                    threshold
                )));
            }
        }

        let dates = history.dates();
        info!(
            "Running backtest '{}': {} engine, {} policy, {} dates ({} to {})",
            label,
            self.config.engine,
            self.config.policy,
            dates.len(),
            dates[0],
            dates[dates.len() - 1]
        );

        let mut state = SimulationState {
            portfolio: initial.clone(),
            last_rebalance: dates[0],
            last_prices: initial.prices(),
        };
        let mut value_history = Vec::with_capacity(dates.len());
        let mut trades_history = Vec::new();
        let mut rebalance_dates = Vec::new();
        let mut skipped_rebalances = 0;

        for (index, &date) in dates.iter().enumerate() {
            let (next, outcome) = self.step(state, history, index, target_weights)?;
            state = next;
            if outcome.rebalanced {
                rebalance_dates.push(date);
            }
            if outcome.skipped {
                skipped_rebalances += 1;
            }
            trades_history.extend(
                outcome
                    .trades
                    .into_iter()
                    .map(|trade| DatedTrade { date, trade }),
            );
            value_history.push(ValuePoint {
                date,
                value: outcome.value,
            });
        }

        let values: Vec<f64> = value_history.iter().map(|p| p.value).collect();
        let metrics =
            PerformanceMetrics::calculate(&values, &trades_history, self.config.risk_free_rate);

        info!(
            "Backtest '{}' complete: final value {:.2}, {} rebalances, {} trades, CAGR {:.2}%",
            label,
            values.last().copied().unwrap_or(0.0),
            rebalance_dates.len(),
            trades_history.len(),
            metrics.cagr * 100.0
        );

        Ok(BacktestResult {
            label: label.to_string(),
            engine: self.config.engine,
            value_history,
            trades_history,
            metrics,
            rebalance_dates,
            skipped_rebalances,
        })
    }

    /// Advance the simulation by one date.
    pub fn step(
        &self,
        mut state: SimulationState,
        history: &PriceHistory,
        index: usize,
        target_weights: &Weights,
    ) -> Result<(SimulationState, StepOutcome)> {
        let date = history.dates()[index];

        state.last_prices.extend(history.prices_at(index));
        let held: Vec<String> = state
            .portfolio
            .tickers()
            .filter(|t| t.as_str() != CASH)
            .cloned()
            .collect();
        for ticker in held {
            match history.price(index, &ticker) {
                Some(price) => {
                    state.portfolio.mark(&ticker, price);
                }
                None => debug!("{}: no price for {}, carrying last known", date, ticker),
            }
        }

        let mut outcome = StepOutcome::default();
        if index > 0 && self.should_rebalance(&state, date, target_weights) {
            let total_value = state.portfolio.total_value();
            debug!(
                "{}: rebalancing {} at value {:.2}",
                date, self.config.engine, total_value
            );
            outcome.rebalanced = true;
            match self.rebalance(&state, history, date, target_weights, total_value)? {
                Some(result) => {
                    outcome.trades = self.apply_trades(&mut state, result.trades)?;
                }
                None => outcome.skipped = true,
            }
            state.last_rebalance = date;
        }

        outcome.value = state.portfolio.total_value();
        Ok((state, outcome))
    }

    fn should_rebalance(&self, state: &SimulationState, date: NaiveDate, target: &Weights) -> bool {
        match self.config.policy {
            RebalancePolicy::Monthly => month_index(date) - month_index(state.last_rebalance) >= 1,
            RebalancePolicy::Quarterly => month_index(date) - month_index(state.last_rebalance) >= 3,
            RebalancePolicy::Drift { threshold } => {
                let actual = state.portfolio.weights();
                target.iter().any(|(ticker, &tw)| {
                    let aw = actual.get(ticker).copied().unwrap_or(0.0);
                    if tw > 0.0 {
                        (aw - tw).abs() / tw > threshold
                    } else {
                        aw > threshold
                    }
                })
            }
        }
    }

    /// Run the configured engine. `None` means the step was skipped.
    fn rebalance(
        &self,
        state: &SimulationState,
        history: &PriceHistory,
        date: NaiveDate,
        target_weights: &Weights,
        total_value: f64,
    ) -> Result<Option<RebalanceResult>> {
        let portfolio = &state.portfolio;
        let prices = &state.last_prices;
        let trading = &self.config.trading;

        let result = match self.config.engine {
            RebalanceEngine::Deterministic => {
                rebalance_deterministic(portfolio, target_weights, total_value, prices, trading)?
            }
            RebalanceEngine::Convex => {
                let params = ConvexParams {
                    trading: trading.clone(),
                    solver: self.config.solver.clone(),
                    ..self.config.convex.clone()
                };
                ConvexRebalancer::new(params).rebalance(portfolio, target_weights, total_value, prices)?
            }
            RebalanceEngine::Mvo => match self.mvo_weights(history, date) {
                Some(weights) => {
                    rebalance_deterministic(portfolio, &weights, total_value, prices, trading)?
                }
                None => return Ok(None),
            },
        };

        if !result.is_success() {
            warn!(
                "{}: {} rebalance failed ({}), skipping",
                date,
                self.config.engine,
                result.error.as_deref().unwrap_or("no detail")
            );
            return Ok(None);
        }
        Ok(Some(result))
    }

    /// Optimal weights over the trailing lookback window, or `None` to skip.
    fn mvo_weights(&self, history: &PriceHistory, date: NaiveDate) -> Option<Weights> {
        let start = date - Duration::days(self.config.mvo.lookback_days);
        let window = history.slice_dates(start, date).drop_incomplete_columns();
        if window.tickers().len() < 2 || window.is_empty() {
            warn!("{}: not enough data for MVO, skipping", date);
            return None;
        }

        let optimizer = MeanVarianceOptimizer::new(self.config.solver.clone());
        match optimizer.optimize(&window, self.config.risk_free_rate, &self.config.mvo.constraints) {
            Ok(result) if result.is_success() => Some(
                result
                    .optimal_weights
                    .into_iter()
                    .filter(|(_, w)| *w > 1e-6)
                    .collect(),
            ),
            Ok(result) => {
                warn!("{}: MVO ended with status {}, skipping", date, result.status);
                None
            }
            Err(e) => {
                warn!("{}: MVO failed: {}, skipping", date, e);
                None
            }
        }
    }

    /// Apply trades at the last known prices; returns the trades executed.
    fn apply_trades(&self, state: &mut SimulationState, trades: Vec<Trade>) -> Result<Vec<Trade>> {
        let fee = self.config.trading.fees_per_trade;
        let mut executed = Vec::with_capacity(trades.len());
        for trade in trades {
            if trade.ticker == CASH {
                state.portfolio.apply_trade(&trade, None, 0.0)?;
                executed.push(trade);
                continue;
            }
            match state.last_prices.get(&trade.ticker).copied() {
                Some(price) => {
                    state.portfolio.apply_trade(&trade, Some(price), fee)?;
                    executed.push(trade);
                }
                None => warn!("Dropping {}: no known price", trade),
            }
        }
        Ok(executed)
    }
}

/// Run a single backtest.
pub fn run_backtest(
    history: &PriceHistory,
    initial: &Portfolio,
    target_weights: &Weights,
    config: &BacktestConfig,
) -> Result<BacktestResult> {
    Backtester::new(config.clone()).run(history, initial, target_weights)
}

/// Spread the value of `initial` over `baseline_weights` at first-date prices.
fn baseline_portfolio(
    history: &PriceHistory,
    initial: &Portfolio,
    baseline_weights: &Weights,
) -> Result<Portfolio> {
    let total = initial.total_value();
    let mut portfolio = Portfolio::new();
    let mut cash = 0.0;
    for (ticker, &weight) in baseline_weights {
        let value = total * weight;
        if ticker == CASH {
            cash += value;
            continue;
        }
        match history.price(0, ticker) {
            Some(price) => portfolio.insert(
                ticker.clone(),
                AssetPosition::Holding {
                    amount: value / price,
                    price,
                },
            )?,
            None => {
                warn!("Baseline: no first-date price for {}, holding its value as cash", ticker);
                cash += value;
            }
        }
    }
    portfolio.set_cash(cash);
    Ok(portfolio)
}

/// Run every engine plus a static baseline, in parallel.
///
/// Labels: `deterministic`, `convex`, `mvo` (caller's policy) and `baseline`
/// (`baseline_weights`, quarterly, deterministic).
pub fn compare_strategies(
    history: &PriceHistory,
    initial: &Portfolio,
    target_weights: &Weights,
    baseline_weights: &Weights,
    config: &BacktestConfig,
) -> Result<BTreeMap<String, BacktestResult>> {
    let mut runs: Vec<(String, BacktestConfig, Portfolio, &Weights)> = [
        RebalanceEngine::Deterministic,
        RebalanceEngine::Convex,
        RebalanceEngine::Mvo,
    ]
    .into_iter()
    .map(|engine| {
        let config = BacktestConfig {
            engine,
            ..config.clone()
        };
        (engine.to_string(), config, initial.clone(), target_weights)
    })
    .collect();

    let baseline_config = BacktestConfig {
        engine: RebalanceEngine::Deterministic,
        policy: RebalancePolicy::Quarterly,
        ..config.clone()
    };
    runs.push((
        "baseline".to_string(),
        baseline_config,
        baseline_portfolio(history, initial, baseline_weights)?,
        baseline_weights,
    ));

    info!("Comparing {} strategies", runs.len());

    let results: Vec<(String, BacktestResult)> = runs
        .par_iter()
        .map(|(label, config, portfolio, weights)| {
            Backtester::new(config.clone())
                .run_labeled(label, history, portfolio, weights)
                .map(|result| (label.clone(), result))
        })
        .collect::<Result<_>>()?;

    Ok(results.into_iter().collect())
}
