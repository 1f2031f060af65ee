//! Command-line interface for the rebalancing engine.

use portfolio_balancer::analytics::{
    annualized_volatility, daily_returns, risk_metrics, BacktestReport, ResultFormatter,
};
use portfolio_balancer::config::{parse_engine, parse_policy, BalancerFileConfig};
use portfolio_balancer::convex::rebalance_convex;
use portfolio_balancer::data::{load_price_csv, PriceHistory, PriceHistoryProvider};
use portfolio_balancer::engine::{compare_strategies, run_backtest};
use portfolio_balancer::error::{BalancerError, Result};
use portfolio_balancer::mvo::MeanVarianceOptimizer;
use portfolio_balancer::recommend::generate_recommendations;
use portfolio_balancer::rebalance::rebalance_deterministic;
use portfolio_balancer::types::{RebalanceResult, CASH};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::path::PathBuf;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Portfolio rebalancing and strategy evaluation.
#[derive(Parser)]
#[command(name = "portfolio-balancer")]
#[command(version)]
#[command(about = "Rebalance portfolios, optimize allocations and backtest rebalancing strategies")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute the trades that move the configured portfolio to its targets
    Rebalance {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Rebalancing method
        #[arg(short, long, value_enum, default_value = "deterministic")]
        method: RebalanceMethod,
    },

    /// Find minimum-variance weights over the price history
    Optimize {
        #[arg(short, long)]
        config: PathBuf,

        /// Price CSV (overrides the config's data path)
        #[arg(short, long)]
        prices: Option<PathBuf>,

        /// Annual target return (e.g. 0.08)
        #[arg(long)]
        target_return: Option<f64>,
    },

    /// Backtest the configured portfolio against a price history
    Backtest {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        prices: Option<PathBuf>,

        /// Rebalance policy (monthly, quarterly, drift)
        #[arg(long)]
        policy: Option<String>,

        /// Rebalance engine (deterministic, convex, mvo)
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// Backtest every engine plus the static baseline side by side
    Compare {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        prices: Option<PathBuf>,
    },

    /// Show volatility and risk metrics of the configured portfolio
    Stats {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        prices: Option<PathBuf>,
    },

    /// Print rule-based advice for the configured portfolio
    Recommend {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        prices: Option<PathBuf>,

        /// Maximum acceptable annualized volatility
        #[arg(short, long)]
        risk_tolerance: Option<f64>,
    },

    /// Write an example configuration file
    ExampleConfig {
        /// Output file path
        #[arg(short, long, default_value = "portfolio.toml")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RebalanceMethod {
    Deterministic,
    Convex,
}

impl Cli {
    fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Logging already initialized");
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Rebalance { config, method } => run_rebalance(config, *method, cli.output),

        Commands::Optimize {
            config,
            prices,
            target_return,
        } => run_optimize(config, prices.as_ref(), *target_return, cli.output),

        Commands::Backtest {
            config,
            prices,
            policy,
            engine,
        } => run_single_backtest(
            config,
            prices.as_ref(),
            policy.as_deref(),
            engine.as_deref(),
            cli.output,
        ),

        Commands::Compare { config, prices } => run_compare(config, prices.as_ref(), cli.output),

        Commands::Stats { config, prices } => run_stats(config, prices.as_ref(), cli.output),

        Commands::Recommend {
            config,
            prices,
            risk_tolerance,
        } => run_recommend(config, prices.as_ref(), *risk_tolerance, cli.output),

        Commands::ExampleConfig { output } => init_config(output),
    }
}

/// Load the price CSV named on the command line or in the config, clipped to
/// the configured date range.
fn load_prices(file_config: &BalancerFileConfig, override_path: Option<&PathBuf>) -> Result<PriceHistory> {
    let path = match override_path {
        Some(p) => p.clone(),
        None => file_config
            .data
            .path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| BalancerError::ConfigError("No data path specified in config".to_string()))?,
    };
    let history = load_price_csv(&path, &file_config.price_csv_config()?)?;

    let (start, end) = file_config.date_range()?;
    if start.is_none() && end.is_none() {
        return Ok(history);
    }
    let (Some(first), Some(last)) = (history.dates().first(), history.dates().last()) else {
        return Ok(history);
    };
    let tickers = history.tickers().to_vec();
    history.price_history(&tickers, start.unwrap_or(*first), end.unwrap_or(*last))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_rebalance(config_path: &PathBuf, method: RebalanceMethod, output: OutputFormat) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let portfolio = &file_config.portfolio;
    if file_config.targets.is_empty() {
        return Err(BalancerError::ConfigError(
            "No [targets] specified in config".to_string(),
        ));
    }

    let total_value = portfolio.total_value();
    let prices = portfolio.prices();
    info!("Rebalancing {:.2} with the {:?} method", total_value, method);

    let result = match method {
        RebalanceMethod::Deterministic => rebalance_deterministic(
            portfolio,
            &file_config.targets,
            total_value,
            &prices,
            &file_config.trading_params(),
        )?,
        RebalanceMethod::Convex => rebalance_convex(
            portfolio,
            &file_config.targets,
            total_value,
            &prices,
            &file_config.convex_params(),
        )?,
    };

    match output {
        OutputFormat::Json => print_json(&result),
        OutputFormat::Text => {
            print_rebalance(&result, total_value);
            Ok(())
        }
    }
}

fn print_rebalance(result: &RebalanceResult, total_value: f64) {
    println!("Portfolio value: ${:.2}", total_value);
    println!("Status: {}", result.status);
    if let Some(err) = &result.error {
        println!("{}", format!("Error: {}", err).red());
    }

    if result.trades.is_empty() {
        println!("No trades required.");
    } else {
        let mut builder = Builder::new();
        builder.push_record(["Action", "Ticker", "Amount"]);
        for trade in &result.trades {
            builder.push_record([
                trade.action.to_string(),
                trade.ticker.clone(),
                format!("{:.2}", trade.amount),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    let mut builder = Builder::new();
    builder.push_record(["Ticker", "Weight %"]);
    for (ticker, weight) in &result.post_trade_weights_estimate {
        builder.push_record([ticker.clone(), format!("{:.2}", weight * 100.0)]);
    }
    println!("Estimated weights after trading:");
    println!("{}", builder.build().with(Style::rounded()));

    for warning in &result.warnings {
        println!("{}", format!("warning: {}", warning).yellow());
    }
}

fn run_optimize(
    config_path: &PathBuf,
    prices_path: Option<&PathBuf>,
    target_return: Option<f64>,
    output: OutputFormat,
) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let history = load_prices(&file_config, prices_path)?.drop_incomplete_columns();

    let mut constraints = file_config.mvo_constraints();
    if target_return.is_some() {
        constraints.target_return = target_return;
    }

    let optimizer = MeanVarianceOptimizer::new(file_config.solver.clone());
    let result = optimizer.optimize(&history, file_config.backtest.risk_free_rate, &constraints)?;

    match output {
        OutputFormat::Json => print_json(&result),
        OutputFormat::Text => {
            println!("Status: {}", result.status);
            if let Some(message) = &result.message {
                println!("{}", message.yellow());
            }
            if result.is_success() {
                let mut builder = Builder::new();
                builder.push_record(["Ticker", "Weight %"]);
                for (ticker, weight) in &result.optimal_weights {
                    builder.push_record([ticker.clone(), format!("{:.2}", weight * 100.0)]);
                }
                println!("{}", builder.build().with(Style::rounded()));
                println!("Expected return:     {:>8.2}%", result.expected_return * 100.0);
                println!("Expected volatility: {:>8.2}%", result.expected_volatility * 100.0);
                println!("Sharpe ratio:        {:>8.2}", result.sharpe_ratio);
            }
            Ok(())
        }
    }
}

fn run_single_backtest(
    config_path: &PathBuf,
    prices_path: Option<&PathBuf>,
    policy: Option<&str>,
    engine: Option<&str>,
    output: OutputFormat,
) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let mut backtest_config = file_config.to_backtest_config()?;
    if let Some(name) = policy {
        backtest_config.policy = parse_policy(name, file_config.backtest.drift_threshold)?;
    }
    if let Some(name) = engine {
        backtest_config.engine = parse_engine(name)?;
    }

    let history = load_prices(&file_config, prices_path)?;
    info!(
        "Backtesting {} dates with {} engine, {} policy",
        history.len(),
        backtest_config.engine,
        backtest_config.policy
    );
    let result = run_backtest(
        &history,
        &file_config.portfolio,
        &file_config.targets,
        &backtest_config,
    )?;

    match output {
        OutputFormat::Text => {
            ResultFormatter::print_report(&result);
            Ok(())
        }
        OutputFormat::Json => print_json(&result),
    }
}

fn run_compare(config_path: &PathBuf, prices_path: Option<&PathBuf>, output: OutputFormat) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let backtest_config = file_config.to_backtest_config()?;
    let history = load_prices(&file_config, prices_path)?;

    let baseline = if file_config.baseline.is_empty() {
        &file_config.targets
    } else {
        &file_config.baseline
    };
    let results = compare_strategies(
        &history,
        &file_config.portfolio,
        &file_config.targets,
        baseline,
        &backtest_config,
    )?;
    let report = BacktestReport::from_results(&results);

    match output {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Text => {
            println!("{}", ResultFormatter::metrics_table(&report));
            if let Some(best) = report.best_by_sharpe() {
                println!("Best by Sharpe ratio: {}", best.green().bold());
            }
            Ok(())
        }
    }
}

fn run_stats(config_path: &PathBuf, prices_path: Option<&PathBuf>, output: OutputFormat) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let weights = file_config.portfolio.weights();
    let held: Vec<String> = weights.keys().filter(|t| *t != CASH).cloned().collect();
    let history = load_prices(&file_config, prices_path)?.select(&held);
    if history.tickers().is_empty() {
        return Err(BalancerError::InsufficientData(
            "no price data for any held asset".to_string(),
        ));
    }

    let returns = daily_returns(&history)?;
    let asset_vols = annualized_volatility(&returns);

    let raw: Vec<f64> = returns
        .tickers
        .iter()
        .map(|t| weights.get(t).copied().unwrap_or(0.0))
        .collect();
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 {
        return Err(BalancerError::InvalidInput(
            "portfolio holds no priced assets".to_string(),
        ));
    }
    let aligned: Vec<f64> = raw.iter().map(|w| w / sum).collect();
    let metrics = risk_metrics(
        &history.select(&returns.tickers),
        &aligned,
        file_config.backtest.risk_free_rate,
    )?;

    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "total_value": file_config.portfolio.total_value(),
            "weights": weights,
            "asset_volatility": asset_vols,
            "risk": metrics,
        })),
        OutputFormat::Text => {
            let mut builder = Builder::new();
            builder.push_record(["Ticker", "Weight %", "Volatility %"]);
            for (ticker, weight) in &weights {
                let vol = asset_vols
                    .get(ticker)
                    .map(|v| format!("{:.2}", v * 100.0))
                    .unwrap_or_else(|| "-".to_string());
                builder.push_record([ticker.clone(), format!("{:.2}", weight * 100.0), vol]);
            }
            println!("Portfolio value: ${:.2}", file_config.portfolio.total_value());
            println!("{}", builder.build().with(Style::rounded()));
            println!("Risk score:      {:>8.4}", metrics.risk_score);
            println!("Volatility:      {:>8.2}%", metrics.volatility * 100.0);
            println!("Sharpe ratio:    {:>8.2}", metrics.sharpe_ratio);
            Ok(())
        }
    }
}

fn run_recommend(
    config_path: &PathBuf,
    prices_path: Option<&PathBuf>,
    risk_tolerance: Option<f64>,
    output: OutputFormat,
) -> Result<()> {
    let file_config = BalancerFileConfig::load(config_path)?;
    let history = load_prices(&file_config, prices_path)?;
    let tolerance = risk_tolerance.unwrap_or(file_config.backtest.risk_tolerance);

    let advice = generate_recommendations(&file_config.portfolio.weights(), tolerance, &history)?;

    match output {
        OutputFormat::Json => print_json(&advice),
        OutputFormat::Text => {
            for (i, item) in advice.iter().enumerate() {
                println!("{}. {}", i + 1, item);
            }
            Ok(())
        }
    }
}

fn init_config(output: &PathBuf) -> Result<()> {
    let example = BalancerFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to describe your portfolio, then run:");
    println!("  portfolio-balancer rebalance -c {}", output.display());
    println!("  portfolio-balancer compare -c {}", output.display());
    Ok(())
}
