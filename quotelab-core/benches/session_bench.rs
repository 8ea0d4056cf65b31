//! Full-session throughput over synthetic quote bars.

use chrono::{DateTime, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use quotelab_core::domain::bar::Bars;
use quotelab_core::feed::{synthetic, InMemoryFeed};
use quotelab_core::strategy::{Context, Session, Strategy};

const INSTRUMENT: &str = "eurusd";

/// Simple moving-average crossover, enough to keep the broker busy.
struct SmaCross {
    closes: Vec<f64>,
    fast: usize,
    slow: usize,
    position: Option<quotelab_core::strategy::position::PositionId>,
}

impl SmaCross {
    fn new(fast: usize, slow: usize) -> Self {
        Self {
            closes: Vec::new(),
            fast,
            slow,
            position: None,
        }
    }

    fn sma(&self, period: usize) -> Option<f64> {
        if self.closes.len() < period {
            return None;
        }
        let window = &self.closes[self.closes.len() - period..];
        Some(window.iter().sum::<f64>() / period as f64)
    }
}

impl Strategy for SmaCross {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, bars: &Bars) {
        let Some(bar) = bars.bar(INSTRUMENT) else { return };
        self.closes.push(bar.price());
        let (Some(fast), Some(slow)) = (self.sma(self.fast), self.sma(self.slow)) else {
            return;
        };

        match self.position {
            None if fast > slow => {
                self.position = ctx.enter_long(INSTRUMENT, 10.0, true, false).ok();
            }
            Some(position) if fast < slow => {
                if ctx.exit_market(position, None).is_ok() {
                    self.position = None;
                }
            }
            _ => {}
        }
    }
}

fn bench_session(c: &mut Criterion) {
    let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
    let bars = synthetic::daily_series(17, &[INSTRUMENT], start, 2000).unwrap();

    c.bench_function("sma_cross_2000_bars", |b| {
        b.iter(|| {
            let mut session = Session::new(
                InMemoryFeed::new(bars.clone()),
                SmaCross::new(10, 30),
                100_000.0,
            );
            session.run().unwrap();
            session.result().unwrap()
        })
    });
}

criterion_group!(benches, bench_session);
criterion_main!(benches);
