//! Rule-based portfolio advice.

use crate::analytics::{annualized_volatility, covariance, daily_returns, portfolio_volatility, TRADING_DAYS};
use crate::data::PriceHistory;
use crate::error::{BalancerError, Result};
use crate::types::{Weights, CASH};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Single-position weight above which concentration is flagged.
pub const CONCENTRATION_LIMIT: f64 = 0.25;

/// Mean pairwise correlation of the top holdings above which diversification is advised.
pub const CORRELATION_LIMIT: f64 = 0.7;

const TOP_HOLDINGS: usize = 5;

/// One piece of advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    EmptyPortfolio,
    InsufficientData,
    ReduceConcentration {
        ticker: String,
        weight: f64,
    },
    ReduceVolatility {
        volatility: f64,
        tolerance: f64,
        /// Up to three above-average-volatility assets, most volatile first.
        high_volatility_assets: Vec<String>,
    },
    Diversify {
        tickers: Vec<String>,
        mean_correlation: f64,
    },
    WellBalanced,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::EmptyPortfolio => write!(
                f,
                "Your portfolio is empty. Add some assets to get recommendations."
            ),
            Recommendation::InsufficientData => write!(
                f,
                "Not enough historical price data to generate detailed recommendations."
            ),
            Recommendation::ReduceConcentration { ticker, weight } => write!(
                f,
                "Reduce concentration in {} (currently {:.1}%). Consider diversifying with sector or market ETFs.",
                ticker,
                weight * 100.0
            ),
            Recommendation::ReduceVolatility {
                volatility,
                tolerance,
                high_volatility_assets,
            } => {
                write!(
                    f,
                    "Portfolio volatility ({:.2}%) exceeds your tolerance ({:.2}%). Consider shifting some allocation ",
                    volatility * 100.0,
                    tolerance * 100.0
                )?;
                if !high_volatility_assets.is_empty() {
                    write!(
                        f,
                        "from high-volatility assets like {} ",
                        high_volatility_assets.join(", ")
                    )?;
                }
                write!(f, "to bonds or cash.")
            }
            Recommendation::Diversify {
                tickers,
                mean_correlation,
            } => write!(
                f,
                "Top holdings ({}) are highly correlated (mean {:.2}). Consider adding low-correlation assets.",
                tickers.join(", "),
                mean_correlation
            ),
            Recommendation::WellBalanced => write!(
                f,
                "Your portfolio looks well balanced under the current rules."
            ),
        }
    }
}

/// Advice for a portfolio with actual `weights`, judged against a maximum
/// annualized volatility of `risk_tolerance`.
pub fn generate_recommendations(
    weights: &Weights,
    risk_tolerance: f64,
    prices: &PriceHistory,
) -> Result<Vec<Recommendation>> {
    if !risk_tolerance.is_finite() || risk_tolerance < 0.0 {
        return Err(BalancerError::InvalidInput(format!(
            "risk tolerance must be non-negative, got {}",
            risk_tolerance
        )));
    }
    if weights.is_empty() {
        return Ok(vec![Recommendation::EmptyPortfolio]);
    }

    let held: Vec<String> = weights.keys().cloned().collect();
    let aligned = prices.select(&held);
    if aligned.tickers().is_empty() {
        return Ok(vec![Recommendation::InsufficientData]);
    }
    let returns = match daily_returns(&aligned) {
        Ok(r) if r.len() >= 2 => r,
        _ => return Ok(vec![Recommendation::InsufficientData]),
    };
    let cov = covariance(&returns)?;

    let raw: Vec<f64> = returns
        .tickers
        .iter()
        .map(|t| weights.get(t).copied().unwrap_or(0.0))
        .collect();
    let sum: f64 = raw.iter().sum();
    let aligned_weights: Vec<f64> = if sum > 0.0 {
        raw.iter().map(|w| w / sum).collect()
    } else {
        vec![1.0 / raw.len() as f64; raw.len()]
    };
    let volatility = portfolio_volatility(&aligned_weights, &cov)? * TRADING_DAYS.sqrt();
    debug!("Portfolio volatility for recommendations: {:.4}", volatility);

    let mut advice = Vec::new();

    for (ticker, &weight) in weights {
        if ticker != CASH && weight > CONCENTRATION_LIMIT {
            advice.push(Recommendation::ReduceConcentration {
                ticker: ticker.clone(),
                weight,
            });
        }
    }

    if volatility > risk_tolerance {
        let asset_vols = annualized_volatility(&returns);
        let mean_vol = asset_vols.values().sum::<f64>() / asset_vols.len() as f64;
        let mut high: Vec<(&String, f64)> = asset_vols
            .iter()
            .filter(|(_, v)| **v > mean_vol)
            .map(|(t, v)| (t, *v))
            .collect();
        high.sort_by(|a, b| b.1.total_cmp(&a.1));
        advice.push(Recommendation::ReduceVolatility {
            volatility,
            tolerance: risk_tolerance,
            high_volatility_assets: high.into_iter().take(3).map(|(t, _)| t.clone()).collect(),
        });
    }

    let mut ranked: Vec<(&String, f64)> = weights.iter().map(|(t, w)| (t, *w)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let top: Vec<(String, usize)> = ranked
        .into_iter()
        .take(TOP_HOLDINGS)
        .filter_map(|(t, _)| {
            returns
                .tickers
                .iter()
                .position(|c| c == t)
                .map(|i| (t.clone(), i))
        })
        .collect();
    if top.len() > 1 {
        let corr = cov.correlation();
        let mut total = 0.0;
        let mut pairs = 0;
        for a in 0..top.len() {
            for b in a + 1..top.len() {
                total += corr[top[a].1][top[b].1];
                pairs += 1;
            }
        }
        let mean_correlation = total / pairs as f64;
        if mean_correlation > CORRELATION_LIMIT {
            advice.push(Recommendation::Diversify {
                tickers: top.into_iter().map(|(t, _)| t).collect(),
                mean_correlation,
            });
        }
    }

    if advice.is_empty() {
        advice.push(Recommendation::WellBalanced);
    }
    Ok(advice)
}
