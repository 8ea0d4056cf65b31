//! Quote bars: two-sided OHLC market data units.
//!
//! A [`Bar`] carries separate ask and bid OHLC sides over a half-open time
//! interval. A [`Bars`] groups one bar per instrument under a single shared
//! timestamp. Both validate on construction and are never mutated afterward.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Which side of the quote a price belongs to. Ask is the buy-side quote,
/// bid the sell-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteSide {
    Ask,
    Bid,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("{side:?} high {high} < low {low} at {start}")]
    HighBelowLow {
        side: QuoteSide,
        high: f64,
        low: f64,
        start: DateTime<Utc>,
    },

    #[error("{side:?} {field} {value} outside [{low}, {high}] at {start}")]
    PriceOutsideRange {
        side: QuoteSide,
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
        start: DateTime<Utc>,
    },

    #[error("bar interval end {end} not after start {start}")]
    EmptyInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("no bars supplied")]
    NoBars,

    #[error("bar datetimes are not in sync: {instrument} at {datetime} != {first_instrument} at {first_datetime}")]
    DatetimesOutOfSync {
        instrument: String,
        datetime: DateTime<Utc>,
        first_instrument: String,
        first_datetime: DateTime<Utc>,
    },
}

/// OHLC prices for one side of the quote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Ohlc {
    fn validate(&self, side: QuoteSide, start: DateTime<Utc>) -> Result<(), DataError> {
        if self.high < self.low {
            return Err(DataError::HighBelowLow {
                side,
                high: self.high,
                low: self.low,
                start,
            });
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if value > self.high || value < self.low {
                return Err(DataError::PriceOutsideRange {
                    side,
                    field,
                    value,
                    low: self.low,
                    high: self.high,
                    start,
                });
            }
        }
        Ok(())
    }
}

/// One OHLC quote interval for a single instrument, covering [start, end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ask: Ohlc,
    bid: Ohlc,
    volume: f64,
}

impl Bar {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        ask: Ohlc,
        bid: Ohlc,
        volume: f64,
    ) -> Result<Self, DataError> {
        if end <= start {
            return Err(DataError::EmptyInterval { start, end });
        }
        ask.validate(QuoteSide::Ask, start)?;
        bid.validate(QuoteSide::Bid, start)?;
        Ok(Self {
            start,
            end,
            ask,
            bid,
            volume,
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn ask(&self) -> &Ohlc {
        &self.ask
    }

    pub fn bid(&self) -> &Ohlc {
        &self.bid
    }

    pub fn side(&self, side: QuoteSide) -> &Ohlc {
        match side {
            QuoteSide::Ask => &self.ask,
            QuoteSide::Bid => &self.bid,
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Price a buyer pays right now: the ask-side close.
    pub fn in_price(&self) -> f64 {
        self.ask.close
    }

    /// Price a seller receives right now: the bid-side close.
    pub fn out_price(&self) -> f64 {
        self.bid.close
    }

    /// Marking price for valuation, the sell-side close.
    pub fn price(&self) -> f64 {
        self.out_price()
    }

    /// Calendar date of the session this bar belongs to.
    pub fn session_date(&self) -> NaiveDate {
        self.start.date_naive()
    }
}

/// A group of bars for different instruments sharing one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bars {
    bars: HashMap<String, Bar>,
    datetime: DateTime<Utc>,
}

impl Bars {
    /// Builds a bar set, rejecting empty input and mismatched start times.
    pub fn new(bars: HashMap<String, Bar>) -> Result<Self, DataError> {
        let mut first: Option<(&str, DateTime<Utc>)> = None;
        for (instrument, bar) in &bars {
            match first {
                None => first = Some((instrument, bar.start())),
                Some((first_instrument, first_datetime)) => {
                    if bar.start() != first_datetime {
                        return Err(DataError::DatetimesOutOfSync {
                            instrument: instrument.clone(),
                            datetime: bar.start(),
                            first_instrument: first_instrument.to_string(),
                            first_datetime,
                        });
                    }
                }
            }
        }
        let (_, datetime) = first.ok_or(DataError::NoBars)?;
        Ok(Self { bars, datetime })
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.datetime
    }

    pub fn bar(&self, instrument: &str) -> Option<&Bar> {
        self.bars.get(instrument)
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.bars.contains_key(instrument)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.bars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bar)> {
        self.bars.iter().map(|(instrument, bar)| (instrument.as_str(), bar))
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap()
    }

    fn flat(price: f64) -> Ohlc {
        Ohlc {
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn sample_bar() -> Bar {
        Bar::new(
            ts(0),
            ts(1),
            Ohlc {
                open: 100.5,
                high: 105.5,
                low: 98.5,
                close: 103.5,
            },
            Ohlc {
                open: 100.0,
                high: 105.0,
                low: 98.0,
                close: 103.0,
            },
            50_000.0,
        )
        .unwrap()
    }

    #[test]
    fn valid_bar_constructs() {
        let bar = sample_bar();
        assert_eq!(bar.in_price(), 103.5);
        assert_eq!(bar.out_price(), 103.0);
        assert_eq!(bar.price(), 103.0);
        assert_eq!(bar.session_date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn rejects_high_below_low() {
        let result = Bar::new(
            ts(0),
            ts(1),
            Ohlc {
                open: 100.0,
                high: 97.0,
                low: 98.0,
                close: 97.5,
            },
            flat(100.0),
            0.0,
        );
        assert!(matches!(
            result,
            Err(DataError::HighBelowLow {
                side: QuoteSide::Ask,
                ..
            })
        ));
    }

    #[test]
    fn rejects_open_outside_range_on_either_side() {
        let bad = Ohlc {
            open: 110.0,
            high: 105.0,
            low: 98.0,
            close: 100.0,
        };
        assert!(matches!(
            Bar::new(ts(0), ts(1), bad, flat(100.0), 0.0),
            Err(DataError::PriceOutsideRange {
                side: QuoteSide::Ask,
                field: "open",
                ..
            })
        ));
        assert!(matches!(
            Bar::new(ts(0), ts(1), flat(100.0), bad, 0.0),
            Err(DataError::PriceOutsideRange {
                side: QuoteSide::Bid,
                field: "open",
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_interval() {
        assert!(matches!(
            Bar::new(ts(1), ts(1), flat(100.0), flat(99.0), 0.0),
            Err(DataError::EmptyInterval { .. })
        ));
    }

    #[test]
    fn serde_round_trip_reproduces_bar_exactly() {
        let bar = sample_bar();
        let json = serde_json::to_string(&bar).unwrap();
        let back: Bar = serde_json::from_str(&json).unwrap();
        assert_eq!(bar, back);
    }

    #[test]
    fn bars_require_matching_datetimes() {
        let mut map = HashMap::new();
        map.insert("eurusd".to_string(), sample_bar());
        map.insert(
            "usdjpy".to_string(),
            Bar::new(ts(2), ts(3), flat(151.0), flat(150.9), 0.0).unwrap(),
        );
        assert!(matches!(
            Bars::new(map),
            Err(DataError::DatetimesOutOfSync { .. })
        ));
    }

    #[test]
    fn bars_reject_empty_set() {
        assert!(matches!(Bars::new(HashMap::new()), Err(DataError::NoBars)));
    }

    #[test]
    fn bars_lookup_by_instrument() {
        let mut map = HashMap::new();
        map.insert("eurusd".to_string(), sample_bar());
        let bars = Bars::new(map).unwrap();
        assert_eq!(bars.datetime(), ts(0));
        assert!(bars.contains("eurusd"));
        assert!(bars.bar("usdjpy").is_none());
        assert_eq!(bars.len(), 1);
    }
}
