//! Price history storage, slicing and CSV loading.
//!
//! A [`PriceHistory`] is a dense date × ticker table of closing prices where
//! individual cells may be missing. Rows are kept sorted by date.

use crate::error::{BalancerError, Result};
use crate::types::AssetPrices;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Time-ordered table of closing prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    dates: Vec<NaiveDate>,
    tickers: Vec<String>,
    /// Row-major: `rows[date][ticker]`.
    rows: Vec<Vec<Option<f64>>>,
}

impl PriceHistory {
    /// Build a history from rows. Rows are sorted by date; duplicate dates
    /// keep the first occurrence.
    pub fn new(
        dates: Vec<NaiveDate>,
        tickers: Vec<String>,
        rows: Vec<Vec<Option<f64>>>,
    ) -> Result<Self> {
        if dates.len() != rows.len() {
            return Err(BalancerError::DimensionMismatch {
                expected: dates.len(),
                actual: rows.len(),
            });
        }
        for row in &rows {
            if row.len() != tickers.len() {
                return Err(BalancerError::DimensionMismatch {
                    expected: tickers.len(),
                    actual: row.len(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for ticker in &tickers {
            if !seen.insert(ticker) {
                return Err(BalancerError::InvalidInput(format!(
                    "duplicate ticker column: {}",
                    ticker
                )));
            }
        }
        for (date, row) in dates.iter().zip(rows.iter()) {
            for (ticker, cell) in tickers.iter().zip(row.iter()) {
                if let Some(p) = cell {
                    if !p.is_finite() || *p <= 0.0 {
                        return Err(BalancerError::InvalidInput(format!(
                            "invalid price {} for {} on {}",
                            p, ticker, date
                        )));
                    }
                }
            }
        }

        let mut paired: Vec<(NaiveDate, Vec<Option<f64>>)> = dates.into_iter().zip(rows).collect();
        paired.sort_by_key(|(d, _)| *d);
        let original_len = paired.len();
        paired.dedup_by_key(|(d, _)| *d);
        if paired.len() < original_len {
            warn!("Removed {} duplicate dates", original_len - paired.len());
        }

        let (dates, rows) = paired.into_iter().unzip();
        Ok(Self {
            dates,
            tickers,
            rows,
        })
    }

    /// Build a history from complete per-ticker series sharing `dates`.
    pub fn from_series(dates: Vec<NaiveDate>, series: BTreeMap<String, Vec<f64>>) -> Result<Self> {
        let tickers: Vec<String> = series.keys().cloned().collect();
        for (ticker, values) in &series {
            if values.len() != dates.len() {
                return Err(BalancerError::InvalidInput(format!(
                    "series {} has {} values for {} dates",
                    ticker,
                    values.len(),
                    dates.len()
                )));
            }
        }
        let rows = (0..dates.len())
            .map(|i| tickers.iter().map(|t| Some(series[t][i])).collect())
            .collect();
        Self::new(dates, tickers, rows)
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// Number of rows (dates).
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&[Option<f64>]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    pub fn ticker_index(&self, ticker: &str) -> Option<usize> {
        self.tickers.iter().position(|t| t == ticker)
    }

    /// Price of `ticker` on row `index`, if present.
    pub fn price(&self, index: usize, ticker: &str) -> Option<f64> {
        let col = self.ticker_index(ticker)?;
        self.rows.get(index).and_then(|r| r[col])
    }

    /// Prices available on row `index`.
    pub fn prices_at(&self, index: usize) -> AssetPrices {
        match self.rows.get(index) {
            Some(row) => self
                .tickers
                .iter()
                .zip(row.iter())
                .filter_map(|(t, p)| p.map(|p| (t.clone(), p)))
                .collect(),
            None => AssetPrices::new(),
        }
    }

    /// First available price for `ticker`.
    pub fn first_price(&self, ticker: &str) -> Option<f64> {
        let col = self.ticker_index(ticker)?;
        self.rows.iter().find_map(|r| r[col])
    }

    /// Rows whose date lies in `[start, end]`.
    pub fn slice_dates(&self, start: NaiveDate, end: NaiveDate) -> PriceHistory {
        let (dates, rows) = self
            .dates
            .iter()
            .zip(self.rows.iter())
            .filter(|(d, _)| **d >= start && **d <= end)
            .map(|(d, r)| (*d, r.clone()))
            .unzip();
        PriceHistory {
            dates,
            tickers: self.tickers.clone(),
            rows,
        }
    }

    /// Restrict to the given tickers (unknown tickers are ignored).
    pub fn select(&self, tickers: &[String]) -> PriceHistory {
        let cols: Vec<usize> = tickers
            .iter()
            .filter_map(|t| self.ticker_index(t))
            .collect();
        PriceHistory {
            dates: self.dates.clone(),
            tickers: cols.iter().map(|&c| self.tickers[c].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| cols.iter().map(|&c| r[c]).collect())
                .collect(),
        }
    }

    /// Drop every ticker with at least one missing cell.
    pub fn drop_incomplete_columns(&self) -> PriceHistory {
        let complete: Vec<String> = self
            .tickers
            .iter()
            .enumerate()
            .filter(|(c, _)| self.rows.iter().all(|r| r[*c].is_some()))
            .map(|(_, t)| t.clone())
            .collect();
        if complete.len() < self.tickers.len() {
            debug!(
                "Dropped {} tickers with gaps",
                self.tickers.len() - complete.len()
            );
        }
        self.select(&complete)
    }
}

/// Source of historical prices for a set of tickers.
pub trait PriceHistoryProvider {
    fn price_history(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceHistory>;
}

impl PriceHistoryProvider for PriceHistory {
    fn price_history(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceHistory> {
        if let Some(missing) = tickers.iter().find(|t| self.ticker_index(t).is_none()) {
            return Err(BalancerError::MissingPrice {
                ticker: missing.clone(),
            });
        }
        Ok(self.select(tickers).slice_dates(start, end))
    }
}

/// Configuration for loading a wide price CSV (`date,<ticker>,...`).
#[derive(Debug, Clone)]
pub struct PriceCsvConfig {
    /// Date format of the first column.
    pub date_format: String,
    /// CSV delimiter.
    pub delimiter: u8,
}

impl Default for PriceCsvConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            delimiter: b',',
        }
    }
}

/// Load a wide-format price CSV. Empty cells are gaps.
pub fn load_price_csv(path: impl AsRef<Path>, config: &PriceCsvConfig) -> Result<PriceHistory> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(BalancerError::InvalidInput(
            "price CSV needs a date column and at least one ticker".to_string(),
        ));
    }
    let tickers: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

    let mut dates = Vec::new();
    let mut rows = Vec::new();
    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let date = NaiveDate::parse_from_str(record.get(0).unwrap_or(""), &config.date_format)?;
        let mut row = Vec::with_capacity(tickers.len());
        for col in 1..=tickers.len() {
            let cell = record.get(col).unwrap_or("");
            if cell.is_empty() {
                row.push(None);
                continue;
            }
            let price: f64 = cell.parse().map_err(|_| {
                BalancerError::InvalidInput(format!(
                    "row {}: cannot parse price {:?} for {}",
                    row_num + 1,
                    cell,
                    tickers[col - 1]
                ))
            })?;
            row.push(Some(price));
        }
        dates.push(date);
        rows.push(row);
    }

    let history = PriceHistory::new(dates, tickers, rows)?;
    info!(
        "Loaded {} rows x {} tickers",
        history.len(),
        history.tickers().len()
    );
    Ok(history)
}
