//! Configuration file support.
//!
//! A single TOML file describes the portfolio, the targets and every engine
//! setting so runs can be reproduced from files.

use crate::convex::ConvexParams;
use crate::data::PriceCsvConfig;
use crate::engine::{BacktestConfig, MvoStepConfig, RebalanceEngine, RebalancePolicy};
use crate::error::{BalancerError, Result};
use crate::mvo::MvoConstraints;
use crate::portfolio::Portfolio;
use crate::qp::SolverSettings;
use crate::types::{AssetClass, TradingParams, Weights};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerFileConfig {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub trading: TradingSettings,
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub convex: ConvexSettings,
    #[serde(default)]
    pub mvo: MvoSettings,
    #[serde(default)]
    pub solver: SolverSettings,
    /// Current holdings.
    #[serde(default)]
    pub portfolio: Portfolio,
    /// Target weights.
    #[serde(default)]
    pub targets: Weights,
    /// Static allocation used as the comparison baseline.
    #[serde(default)]
    pub baseline: Weights,
    #[serde(default)]
    pub asset_classes: BTreeMap<String, AssetClass>,
}

/// Price data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the wide price CSV.
    pub path: Option<String>,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Start date (YYYY-MM-DD format).
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date (YYYY-MM-DD format).
    #[serde(default)]
    pub end_date: Option<String>,
}

fn default_date_format() -> String { "%Y-%m-%d".to_string() }
fn default_delimiter() -> char { ',' }

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: None,
            date_format: default_date_format(),
            delimiter: default_delimiter(),
            start_date: None,
            end_date: None,
        }
    }
}

/// Trading settings shared by all engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    #[serde(default = "default_min_trade")]
    pub min_trade_threshold: f64,
    #[serde(default)]
    pub min_cash_reserve: f64,
    #[serde(default)]
    pub fees_per_trade: f64,
    #[serde(default = "default_true")]
    pub round_to_nearest_share: bool,
}

fn default_min_trade() -> f64 { 0.01 }
fn default_true() -> bool { true }

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            min_trade_threshold: default_min_trade(),
            min_cash_reserve: 0.0,
            fees_per_trade: 0.0,
            round_to_nearest_share: true,
        }
    }
}

/// Backtest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    /// "monthly", "quarterly" or "drift".
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Relative drift that triggers a rebalance under the "drift" policy.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// "deterministic", "convex" or "mvo".
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    /// Maximum acceptable annualized volatility for recommendations.
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: f64,
}

fn default_policy() -> String { "quarterly".to_string() }
fn default_drift_threshold() -> f64 { 0.05 }
fn default_engine() -> String { "deterministic".to_string() }
fn default_risk_free_rate() -> f64 { 0.01 }
fn default_risk_tolerance() -> f64 { 0.15 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            drift_threshold: default_drift_threshold(),
            engine: default_engine(),
            risk_free_rate: default_risk_free_rate(),
            risk_tolerance: default_risk_tolerance(),
        }
    }
}

/// Convex rebalancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvexSettings {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_tracking_penalty")]
    pub tracking_penalty: f64,
}

fn default_epsilon() -> f64 { 0.01 }
fn default_tracking_penalty() -> f64 { 1.0 }

impl Default for ConvexSettings {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            tracking_penalty: default_tracking_penalty(),
        }
    }
}

/// Mean-variance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvoSettings {
    pub target_return: Option<f64>,
    pub max_equities_weight: Option<f64>,
    pub max_bonds_weight: Option<f64>,
    pub max_cash_weight: Option<f64>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

fn default_lookback_days() -> i64 { 365 * 5 }

impl Default for MvoSettings {
    fn default() -> Self {
        Self {
            target_return: None,
            max_equities_weight: None,
            max_bonds_weight: None,
            max_cash_weight: None,
            lookback_days: default_lookback_days(),
        }
    }
}

fn parse_date(value: &Option<String>) -> Result<Option<NaiveDate>> {
    value
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .map_err(BalancerError::from)
}

/// Parse a policy name.
pub fn parse_policy(name: &str, drift_threshold: f64) -> Result<RebalancePolicy> {
    match name.to_lowercase().as_str() {
        "monthly" => Ok(RebalancePolicy::Monthly),
        "quarterly" => Ok(RebalancePolicy::Quarterly),
        "drift" => Ok(RebalancePolicy::Drift {
            threshold: drift_threshold,
        }),
        other => Err(BalancerError::ConfigError(format!(
            "unknown rebalance policy: {}",
            other
        ))),
    }
}

/// Parse an engine name.
pub fn parse_engine(name: &str) -> Result<RebalanceEngine> {
    match name.to_lowercase().as_str() {
        "deterministic" => Ok(RebalanceEngine::Deterministic),
        "convex" => Ok(RebalanceEngine::Convex),
        "mvo" => Ok(RebalanceEngine::Mvo),
        other => Err(BalancerError::ConfigError(format!(
            "unknown rebalance engine: {}",
            other
        ))),
    }
}

impl BalancerFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: BalancerFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BalancerError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn trading_params(&self) -> TradingParams {
        TradingParams {
            min_trade_threshold: self.trading.min_trade_threshold,
            min_cash_reserve: self.trading.min_cash_reserve,
            fees_per_trade: self.trading.fees_per_trade,
            round_to_nearest_share: self.trading.round_to_nearest_share,
        }
    }

    pub fn convex_params(&self) -> ConvexParams {
        ConvexParams {
            trading: self.trading_params(),
            epsilon: self.convex.epsilon,
            tracking_penalty: self.convex.tracking_penalty,
            solver: self.solver.clone(),
        }
    }

    pub fn mvo_constraints(&self) -> MvoConstraints {
        MvoConstraints {
            target_return: self.mvo.target_return,
            max_equities_weight: self.mvo.max_equities_weight,
            max_bonds_weight: self.mvo.max_bonds_weight,
            max_cash_weight: self.mvo.max_cash_weight,
            asset_classes: self.asset_classes.clone(),
        }
    }

    pub fn price_csv_config(&self) -> Result<PriceCsvConfig> {
        if !self.data.delimiter.is_ascii() {
            return Err(BalancerError::ConfigError(format!(
                "delimiter must be a single ASCII character, got {:?}",
                self.data.delimiter
            )));
        }
        Ok(PriceCsvConfig {
            date_format: self.data.date_format.clone(),
            delimiter: self.data.delimiter as u8,
        })
    }

    /// Optional `[start, end]` date filter.
    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        Ok((parse_date(&self.data.start_date)?, parse_date(&self.data.end_date)?))
    }

    /// Convert to BacktestConfig for the engine.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let policy = parse_policy(&self.backtest.policy, self.backtest.drift_threshold)?;
        let engine = parse_engine(&self.backtest.engine)?;

        Ok(BacktestConfig {
            policy,
            engine,
            trading: self.trading_params(),
            convex: self.convex_params(),
            mvo: MvoStepConfig {
                constraints: self.mvo_constraints(),
                lookback_days: self.mvo.lookback_days,
            },
            risk_free_rate: self.backtest.risk_free_rate,
            solver: self.solver.clone(),
        })
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Portfolio Balancer Configuration File

[data]
path = "data/prices.csv"
date_format = "%Y-%m-%d"
delimiter = ","
# start_date = "2020-01-01"
# end_date = "2024-12-31"

[trading]
min_trade_threshold = 10.0
min_cash_reserve = 0.0
fees_per_trade = 0.0
round_to_nearest_share = true

[backtest]
policy = "quarterly"        # monthly | quarterly | drift
drift_threshold = 0.05      # 5% relative drift (drift policy only)
engine = "deterministic"    # deterministic | convex | mvo
risk_free_rate = 0.01
risk_tolerance = 0.15       # max annualized volatility for recommendations

[convex]
epsilon = 0.01
tracking_penalty = 1.0

[mvo]
# target_return = 0.08
max_equities_weight = 0.8
# max_bonds_weight = 0.6
# max_cash_weight = 0.1
lookback_days = 1825

[solver]
max_iter = 200
time_limit_secs = 10.0

[portfolio]
SPY = { amount = 50.0, price = 450.0 }
BND = { amount = 100.0, price = 72.0 }
CASH = { value = 5000.0 }

[targets]
SPY = 0.6
BND = 0.35
CASH = 0.05

[baseline]
SPY = 0.6
BND = 0.4

[asset_classes]
SPY = "equities"
BND = "bonds"
CASH = "cash"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BalancerFileConfig::default();
        assert_eq!(config.backtest.policy, "quarterly");
        assert_eq!(config.trading.min_trade_threshold, 0.01);
        assert!(config.portfolio.is_empty());
        let bt = config.to_backtest_config().unwrap();
        assert_eq!(bt.policy, RebalancePolicy::Quarterly);
        assert_eq!(bt.engine, RebalanceEngine::Deterministic);
    }

    #[test]
    fn test_example_parses() {
        let config: BalancerFileConfig = toml::from_str(&BalancerFileConfig::example()).unwrap();
        assert!((config.portfolio.total_value() - 34_700.0).abs() < 1e-9);
        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.asset_classes.get("BND"), Some(&AssetClass::Bonds));
        assert_eq!(config.mvo.max_equities_weight, Some(0.8));
        assert!(config.to_backtest_config().is_ok());
    }

    #[test]
    fn test_load_config() {
        let toml_content = r#"
[backtest]
policy = "drift"
drift_threshold = 0.1
engine = "convex"

[convex]
tracking_penalty = 50.0

[portfolio]
AAPL = { amount = 10.0, price = 150.0 }
CASH = { value = 500.0 }

[targets]
AAPL = 0.8
CASH = 0.2
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = BalancerFileConfig::load(file.path()).unwrap();
        let bt = config.to_backtest_config().unwrap();
        assert_eq!(bt.policy, RebalancePolicy::Drift { threshold: 0.1 });
        assert_eq!(bt.engine, RebalanceEngine::Convex);
        assert_eq!(bt.convex.tracking_penalty, 50.0);
        assert!((config.portfolio.cash() - 500.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_cash_entry_rejected() {
        let toml_content = r#"
[portfolio]
CASH = { amount = 1.0, price = 1.0 }
"#;
        assert!(toml::from_str::<BalancerFileConfig>(toml_content).is_err());
    }

    #[test]
    fn test_unknown_policy() {
        let mut config = BalancerFileConfig::default();
        config.backtest.policy = "weekly".to_string();
        assert!(matches!(
            config.to_backtest_config(),
            Err(BalancerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_date_range() {
        let mut config = BalancerFileConfig::default();
        config.data.start_date = Some("2023-01-01".to_string());
        let (start, end) = config.date_range().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(end, None);

        config.data.end_date = Some("not a date".to_string());
        assert!(config.date_range().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let config: BalancerFileConfig = toml::from_str(&BalancerFileConfig::example()).unwrap();
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let reloaded = BalancerFileConfig::load(file.path()).unwrap();
        assert_eq!(reloaded.targets, config.targets);
        assert_eq!(reloaded.portfolio, config.portfolio);
    }
}
