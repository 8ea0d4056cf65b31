//! Synthetic quote-bar generation for tests, benches, and demos.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::domain::bar::{Bar, Bars, DataError, Ohlc};

/// Seeded random-walk generator producing valid two-sided bars.
pub struct SyntheticQuotes {
    rng: StdRng,
    price: f64,
    spread: f64,
    volatility: f64,
}

impl SyntheticQuotes {
    pub fn new(seed: u64, start_price: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            price: start_price,
            spread: 0.001,
            volatility: 0.02,
        }
    }

    /// Fractional bid/ask spread around the mid price.
    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = spread;
        self
    }

    /// Per-bar fractional price range.
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }

    /// Next bar of the walk over [start, end).
    pub fn next_bar(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Bar, DataError> {
        let open = self.price;
        let close = open * (1.0 + self.rng.gen_range(-self.volatility..self.volatility));
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..self.volatility / 2.0));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..self.volatility / 2.0));
        self.price = close;

        let half = self.spread / 2.0;
        let scale = |ohlc: Ohlc, factor: f64| Ohlc {
            open: ohlc.open * factor,
            high: ohlc.high * factor,
            low: ohlc.low * factor,
            close: ohlc.close * factor,
        };
        let mid = Ohlc {
            open,
            high,
            low,
            close,
        };
        let volume = self.rng.gen_range(10_000.0..100_000.0);
        Bar::new(
            start,
            end,
            scale(mid, 1.0 + half),
            scale(mid, 1.0 - half),
            volume,
        )
    }
}

/// Generates `days` consecutive daily bar sets for the given instruments,
/// one independent walk per instrument.
pub fn daily_series(
    seed: u64,
    instruments: &[&str],
    start: DateTime<Utc>,
    days: usize,
) -> Result<Vec<Bars>, DataError> {
    let mut walks: Vec<SyntheticQuotes> = instruments
        .iter()
        .enumerate()
        .map(|(offset, _)| SyntheticQuotes::new(seed.wrapping_add(offset as u64), 100.0))
        .collect();

    let mut series = Vec::with_capacity(days);
    for day in 0..days {
        let bar_start = start + Duration::days(day as i64);
        let bar_end = bar_start + Duration::days(1);
        let mut set = HashMap::new();
        for (walk, instrument) in walks.iter_mut().zip(instruments) {
            set.insert(instrument.to_string(), walk.next_bar(bar_start, bar_end)?);
        }
        series.push(Bars::new(set)?);
    }
    Ok(series)
}
