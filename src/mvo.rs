//! Mean-variance (Markowitz) optimization.
//!
//! Minimizes daily portfolio variance subject to full investment, long-only
//! weights, optional per-asset-class caps and an optional annual target return.
//! Without a target return the minimum-variance portfolio stands in for the
//! maximum-Sharpe one.

use crate::analytics::{annualize_return, covariance, daily_returns, TRADING_DAYS};
use crate::data::PriceHistory;
use crate::error::{BalancerError, Result};
use crate::qp::{ClarabelSolver, QpSolver, QuadraticProgram, SolverSettings};
use crate::types::{AssetClass, AssetClassProvider, SolveStatus, Weights, CASH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Optional constraints on the optimized portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MvoConstraints {
    /// Minimum annualized return.
    #[serde(default)]
    pub target_return: Option<f64>,
    #[serde(default)]
    pub max_equities_weight: Option<f64>,
    #[serde(default)]
    pub max_bonds_weight: Option<f64>,
    #[serde(default)]
    pub max_cash_weight: Option<f64>,
    /// Ticker → asset class used by the caps.
    #[serde(default)]
    pub asset_classes: BTreeMap<String, AssetClass>,
}

impl MvoConstraints {
    fn caps(&self) -> [(AssetClass, Option<f64>); 3] {
        [
            (AssetClass::Equities, self.max_equities_weight),
            (AssetClass::Bonds, self.max_bonds_weight),
            (AssetClass::Cash, self.max_cash_weight),
        ]
    }
}

/// Result of a mean-variance optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvoResult {
    pub optimal_weights: Weights,
    /// Annualized, compounded from the mean daily return.
    pub expected_return: f64,
    /// Annualized.
    pub expected_volatility: f64,
    pub sharpe_ratio: f64,
    pub status: SolveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MvoResult {
    fn failed(tickers: &[String], status: SolveStatus, message: String) -> Self {
        Self {
            optimal_weights: tickers.iter().map(|t| (t.clone(), 0.0)).collect(),
            expected_return: 0.0,
            expected_volatility: 0.0,
            sharpe_ratio: 0.0,
            status,
            message: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_optimal()
    }
}

/// Markowitz optimizer over a pluggable [`QpSolver`].
#[derive(Debug, Clone, Default)]
pub struct MeanVarianceOptimizer<S: QpSolver = ClarabelSolver> {
    solver: S,
}

impl MeanVarianceOptimizer<ClarabelSolver> {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            solver: ClarabelSolver::new(settings),
        }
    }
}

impl<S: QpSolver> MeanVarianceOptimizer<S> {
    pub fn with_solver(solver: S) -> Self {
        Self { solver }
    }

    /// Optimize using the class map carried by `constraints`.
    pub fn optimize(
        &self,
        prices: &PriceHistory,
        risk_free_rate: f64,
        constraints: &MvoConstraints,
    ) -> Result<MvoResult> {
        self.optimize_with_classes(prices, risk_free_rate, constraints, &constraints.asset_classes)
    }

    /// Optimize, resolving asset classes through `classes`.
    ///
    /// `CASH` counts as [`AssetClass::Cash`] unless the provider says otherwise.
    pub fn optimize_with_classes(
        &self,
        prices: &PriceHistory,
        risk_free_rate: f64,
        constraints: &MvoConstraints,
        classes: &dyn AssetClassProvider,
    ) -> Result<MvoResult> {
        if prices.tickers().is_empty() {
            return Err(BalancerError::InsufficientData(
                "no assets to optimize".to_string(),
            ));
        }
        if !risk_free_rate.is_finite() {
            return Err(BalancerError::InvalidInput(format!(
                "non-finite risk-free rate {}",
                risk_free_rate
            )));
        }

        let returns = daily_returns(prices)?;
        let cov = covariance(&returns)?;
        let mu = returns.means();
        let tickers = returns.tickers.clone();
        let n = tickers.len();

        let mut qp = QuadraticProgram::new(n);
        // normalize so the objective is O(1) regardless of return scale
        let scale = (0..n)
            .map(|i| cov.values[i][i])
            .fold(0.0_f64, f64::max);
        let scale = if scale > 0.0 { scale } else { 1.0 };
        for i in 0..n {
            for j in i..n {
                qp.add_quadratic(i, j, 2.0 * cov.values[i][j] / scale);
            }
        }

        qp.add_equality((0..n).map(|i| (i, 1.0)).collect(), 1.0);
        for i in 0..n {
            qp.add_lower_bound(i, 0.0);
        }

        for (class, cap) in constraints.caps() {
            let Some(cap) = cap else { continue };
            let members: Vec<(usize, f64)> = tickers
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    classes
                        .asset_class(t)
                        .or_else(|| (t.as_str() == CASH).then_some(AssetClass::Cash))
                        == Some(class)
                })
                .map(|(i, _)| (i, 1.0))
                .collect();
            if !members.is_empty() {
                debug!("Capping {} at {:.2} over {} assets", class, cap, members.len());
                qp.add_inequality(members, cap);
            }
        }

        if let Some(target) = constraints.target_return {
            if target > -1.0 {
                let daily_target = (1.0 + target).powf(1.0 / TRADING_DAYS) - 1.0;
                qp.add_inequality(
                    mu.iter().enumerate().map(|(i, m)| (i, -m)).collect(),
                    -daily_target,
                );
            } else {
                warn!("Ignoring target return {} (must exceed -100%)", target);
            }
        }

        let solution = match self.solver.solve(&qp) {
            Ok(solution) => solution,
            Err(e) => {
                warn!("Mean-variance solver error: {}", e);
                return Ok(MvoResult::failed(&tickers, SolveStatus::Error, e.to_string()));
            }
        };
        if !solution.status.is_optimal() {
            warn!("Mean-variance optimization ended with status {}", solution.status);
            return Ok(MvoResult::failed(
                &tickers,
                solution.status,
                format!("solver finished with status {}", solution.status),
            ));
        }

        let clamped: Vec<f64> = solution.x.iter().map(|w| w.max(0.0)).collect();
        let total: f64 = clamped.iter().sum();
        if total <= 0.0 {
            return Ok(MvoResult::failed(
                &tickers,
                SolveStatus::NumericalError,
                "solver returned no positive weights".to_string(),
            ));
        }
        let w: Vec<f64> = clamped.iter().map(|v| v / total).collect();

        let daily_mean: f64 = w.iter().zip(&mu).map(|(w, m)| w * m).sum();
        let expected_return = annualize_return(daily_mean);
        let expected_volatility = cov.quadratic_form(&w)?.max(0.0).sqrt() * TRADING_DAYS.sqrt();
        let sharpe_ratio = if expected_volatility > 0.0 {
            (expected_return - risk_free_rate) / expected_volatility
        } else {
            0.0
        };

        info!(
            "MVO over {} assets: return {:.2}%, volatility {:.2}%, status {}",
            n,
            expected_return * 100.0,
            expected_volatility * 100.0,
            solution.status
        );

        Ok(MvoResult {
            optimal_weights: tickers.into_iter().zip(w).collect(),
            expected_return,
            expected_volatility,
            sharpe_ratio,
            status: solution.status,
            message: None,
        })
    }
}

/// Optimize with the default Clarabel backend.
pub fn optimize_mvo(
    prices: &PriceHistory,
    risk_free_rate: f64,
    constraints: &MvoConstraints,
) -> Result<MvoResult> {
    MeanVarianceOptimizer::new(SolverSettings::default()).optimize(prices, risk_free_rate, constraints)
}
