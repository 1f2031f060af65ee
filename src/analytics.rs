//! Return statistics and performance analytics.
//!
//! All annualization assumes daily data and 252 trading days per year.

use crate::data::PriceHistory;
use crate::engine::BacktestResult;
use crate::error::{BalancerError, Result};
use crate::types::DatedTrade;
use chrono::NaiveDate;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::{builder::Builder, settings::Style};

/// Trading days per year.
pub const TRADING_DAYS: f64 = 252.0;

/// Daily simple returns, one row per date, one column per ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Returns {
    pub dates: Vec<NaiveDate>,
    pub tickers: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl Returns {
    /// Number of return rows.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Return series for column `index`.
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[index]).collect()
    }

    /// Mean daily return per ticker.
    pub fn means(&self) -> Vec<f64> {
        (0..self.tickers.len())
            .map(|c| mean(&self.column(c)))
            .collect()
    }

    /// Weighted daily portfolio returns.
    pub fn portfolio_returns(&self, weights: &[f64]) -> Result<Vec<f64>> {
        if weights.len() != self.tickers.len() {
            return Err(BalancerError::DimensionMismatch {
                expected: self.tickers.len(),
                actual: weights.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .map(|row| row.iter().zip(weights).map(|(r, w)| r * w).sum())
            .collect())
    }
}

/// Square covariance matrix labelled by ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    pub tickers: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl CovarianceMatrix {
    pub fn dim(&self) -> usize {
        self.tickers.len()
    }

    /// wᵗΣw.
    pub fn quadratic_form(&self, weights: &[f64]) -> Result<f64> {
        if weights.len() != self.dim() {
            return Err(BalancerError::DimensionMismatch {
                expected: self.dim(),
                actual: weights.len(),
            });
        }
        let mut total = 0.0;
        for (i, wi) in weights.iter().enumerate() {
            for (j, wj) in weights.iter().enumerate() {
                total += wi * wj * self.values[i][j];
            }
        }
        Ok(total)
    }

    /// Correlation matrix; zero-variance assets get zero correlation.
    pub fn correlation(&self) -> Vec<Vec<f64>> {
        let n = self.dim();
        let std: Vec<f64> = (0..n).map(|i| self.values[i][i].max(0.0).sqrt()).collect();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        if std[i] > 0.0 && std[j] > 0.0 {
                            self.values[i][j] / (std[i] * std[j])
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n − 1); 0 for fewer than two values.
pub(crate) fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Percentage change row over row, first row dropped.
///
/// Rows where any ticker lacks a price on either side are dropped.
pub fn daily_returns(prices: &PriceHistory) -> Result<Returns> {
    if prices.len() < 2 {
        return Err(BalancerError::InsufficientData(format!(
            "need at least 2 price rows, have {}",
            prices.len()
        )));
    }

    let mut dates = Vec::new();
    let mut values = Vec::new();
    for i in 1..prices.len() {
        let (Some(prev), Some(cur)) = (prices.row(i - 1), prices.row(i)) else {
            continue;
        };
        let row: Option<Vec<f64>> = prev
            .iter()
            .zip(cur.iter())
            .map(|(p, c)| match (p, c) {
                (Some(p), Some(c)) => Some(c / p - 1.0),
                _ => None,
            })
            .collect();
        if let Some(row) = row {
            dates.push(prices.dates()[i]);
            values.push(row);
        }
    }

    Ok(Returns {
        dates,
        tickers: prices.tickers().to_vec(),
        values,
    })
}

/// Sample covariance matrix of the return columns.
pub fn covariance(returns: &Returns) -> Result<CovarianceMatrix> {
    if returns.len() < 2 {
        return Err(BalancerError::InsufficientData(format!(
            "need at least 2 return rows for covariance, have {}",
            returns.len()
        )));
    }
    let n = returns.tickers.len();
    let columns: Vec<Vec<f64>> = (0..n).map(|c| returns.column(c)).collect();
    let means: Vec<f64> = columns.iter().map(|c| mean(c)).collect();
    let denom = (returns.len() - 1) as f64;

    let mut values = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let cov = columns[i]
                .iter()
                .zip(columns[j].iter())
                .map(|(ri, rj)| (ri - means[i]) * (rj - means[j]))
                .sum::<f64>()
                / denom;
            values[i][j] = cov;
            values[j][i] = cov;
        }
    }

    Ok(CovarianceMatrix {
        tickers: returns.tickers.clone(),
        values,
    })
}

/// Correlation matrix of `cov`.
pub fn correlation(cov: &CovarianceMatrix) -> Vec<Vec<f64>> {
    cov.correlation()
}

/// Per-asset sample standard deviation × √252.
pub fn annualized_volatility(returns: &Returns) -> BTreeMap<String, f64> {
    returns
        .tickers
        .iter()
        .enumerate()
        .map(|(c, t)| (t.clone(), sample_std(&returns.column(c)) * TRADING_DAYS.sqrt()))
        .collect()
}

/// √(wᵗΣw).
pub fn portfolio_volatility(weights: &[f64], cov: &CovarianceMatrix) -> Result<f64> {
    Ok(cov.quadratic_form(weights)?.max(0.0).sqrt())
}

/// Annualize a mean daily return by compounding.
pub fn annualize_return(mean_daily_return: f64) -> f64 {
    (1.0 + mean_daily_return).powf(TRADING_DAYS) - 1.0
}

/// Sharpe ratio of a daily return series against an annualized volatility.
///
/// Returns 0 when `volatility` is 0 or the series is empty.
pub fn sharpe_ratio(daily_returns: &[f64], volatility: f64, risk_free_rate: f64) -> f64 {
    if volatility == 0.0 || daily_returns.is_empty() {
        return 0.0;
    }
    (annualize_return(mean(daily_returns)) - risk_free_rate) / volatility
}

/// Risk summary of a weighted portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Currently equal to the annualized volatility.
    pub risk_score: f64,
    /// Annualized portfolio volatility.
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

/// Volatility and Sharpe ratio of `weights` (aligned with the history's tickers).
pub fn risk_metrics(prices: &PriceHistory, weights: &[f64], risk_free_rate: f64) -> Result<RiskMetrics> {
    let returns = daily_returns(prices)?;
    let cov = covariance(&returns)?;
    if weights.len() != cov.dim() {
        return Err(BalancerError::DimensionMismatch {
            expected: cov.dim(),
            actual: weights.len(),
        });
    }
    let volatility = portfolio_volatility(weights, &cov)? * TRADING_DAYS.sqrt();
    let portfolio_returns = returns.portfolio_returns(weights)?;
    let sharpe = sharpe_ratio(&portfolio_returns, volatility, risk_free_rate);

    Ok(RiskMetrics {
        risk_score: volatility,
        volatility,
        sharpe_ratio: sharpe,
    })
}

/// Simple returns of a value series.
pub fn value_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Compound annual growth rate over `values.len() - 1` daily periods.
pub fn cagr(values: &[f64]) -> f64 {
    let periods = values.len().saturating_sub(1);
    match (values.first(), values.last()) {
        (Some(&first), Some(&last)) if periods > 0 && first > 0.0 && last >= 0.0 => {
            (last / first).powf(TRADING_DAYS / periods as f64) - 1.0
        }
        _ => 0.0,
    }
}

/// Minimum of `value / running_max - 1` (0 or negative).
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst: f64 = 0.0;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.min(v / peak - 1.0);
        }
    }
    worst
}

/// Total traded dollars over mean portfolio value.
pub fn turnover(trades: &[DatedTrade], values: &[f64]) -> f64 {
    let avg = mean(values);
    if avg <= 0.0 {
        return 0.0;
    }
    trades.iter().map(|t| t.trade.amount.abs()).sum::<f64>() / avg
}

/// Backtest performance summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cagr: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub turnover: f64,
}

impl PerformanceMetrics {
    /// Compute metrics from a value series and the trades executed along it.
    pub fn calculate(values: &[f64], trades: &[DatedTrade], risk_free_rate: f64) -> Self {
        let returns = value_returns(values);
        let volatility = sample_std(&returns) * TRADING_DAYS.sqrt();
        Self {
            cagr: cagr(values),
            sharpe_ratio: sharpe_ratio(&returns, volatility, risk_free_rate),
            max_drawdown: max_drawdown(values),
            turnover: turnover(trades, values),
        }
    }
}

/// Summary of several labelled backtest runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub summary_metrics: BTreeMap<String, PerformanceMetrics>,
    pub value_histories: BTreeMap<String, Vec<(NaiveDate, f64)>>,
}

impl BacktestReport {
    pub fn from_results(results: &BTreeMap<String, BacktestResult>) -> Self {
        Self {
            summary_metrics: results
                .iter()
                .map(|(label, r)| (label.clone(), r.metrics))
                .collect(),
            value_histories: results
                .iter()
                .map(|(label, r)| {
                    (
                        label.clone(),
                        r.value_history.iter().map(|p| (p.date, p.value)).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Label with the highest Sharpe ratio.
    pub fn best_by_sharpe(&self) -> Option<&str> {
        self.summary_metrics
            .iter()
            .filter(|(_, m)| m.sharpe_ratio.is_finite())
            .max_by(|a, b| {
                a.1.sharpe_ratio
                    .partial_cmp(&b.1.sharpe_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(label, _)| label.as_str())
    }
}

/// Terminal rendering of backtest output.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Render a comparison table of labelled metrics.
    pub fn metrics_table(report: &BacktestReport) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Strategy", "CAGR %", "Sharpe", "Max DD %", "Turnover", "Final Value"]);

        for (label, m) in &report.summary_metrics {
            let final_value = report
                .value_histories
                .get(label)
                .and_then(|h| h.last())
                .map(|(_, v)| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string());
            builder.push_record([
                label.clone(),
                format!("{:.2}", m.cagr * 100.0),
                format!("{:.2}", m.sharpe_ratio),
                format!("{:.2}", m.max_drawdown * 100.0),
                format!("{:.2}", m.turnover),
                final_value,
            ]);
        }

        builder.build().with(Style::rounded()).to_string()
    }

    /// Print a single backtest run.
    pub fn print_report(result: &BacktestResult) {
        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", format!(" BACKTEST: {} ", result.label).bold().blue());
        println!("{}", "═".repeat(60).blue());
        if let (Some(first), Some(last)) = (result.value_history.first(), result.value_history.last()) {
            println!("  Period:          {} to {}", first.date, last.date);
            println!("  Initial Value:   ${:>12.2}", first.value);
            println!("  Final Value:     ${:>12.2}", last.value);
        }
        println!("  CAGR:            {}", Self::format_pct(result.metrics.cagr * 100.0));
        println!("  Sharpe Ratio:    {:>12.2}", result.metrics.sharpe_ratio);
        println!("  Max Drawdown:    {:>12.2}%", result.metrics.max_drawdown * 100.0);
        println!("  Turnover:        {:>12.2}", result.metrics.turnover);
        println!("  Rebalances:      {:>12}", result.rebalance_dates.len());
        println!("  Trades:          {:>12}", result.trades_history.len());
        if result.skipped_rebalances > 0 {
            println!(
                "  {}",
                format!("Skipped rebalances: {}", result.skipped_rebalances).yellow()
            );
        }
        println!("{}", "═".repeat(60).blue());
    }

    fn format_pct(pct: f64) -> String {
        let s = format!("{:>11.2}%", pct);
        if pct >= 0.0 {
            s.green().to_string()
        } else {
            s.red().to_string()
        }
    }
}
