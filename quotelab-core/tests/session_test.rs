//! End-to-end session runs: strategy callbacks, position lifecycle, results.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use quotelab_core::domain::bar::{Bar, Bars, Ohlc};
use quotelab_core::feed::InMemoryFeed;
use quotelab_core::strategy::position::{PositionId, PositionState};
use quotelab_core::strategy::{Context, Session, Strategy};

const INSTRUMENT: &str = "eurusd";

fn flat_bars(day: i64, price: f64) -> Bars {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
    let ohlc = Ohlc {
        open: price,
        high: price,
        low: price,
        close: price,
    };
    let bar = Bar::new(start, start + Duration::days(1), ohlc, ohlc, 1000.0).unwrap();
    let mut map = HashMap::new();
    map.insert(INSTRUMENT.to_string(), bar);
    Bars::new(map).unwrap()
}

/// Enters long on the first tick, exits two ticks later, and records every
/// callback the session fires.
#[derive(Default)]
struct RoundTrip {
    tick: usize,
    position: Option<PositionId>,
    callbacks: Vec<String>,
    entry_shares: f64,
    exit_pnl: f64,
}

impl Strategy for RoundTrip {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, _bars: &Bars) {
        self.tick += 1;
        if self.tick == 1 {
            let id = ctx.enter_long(INSTRUMENT, 10.0, true, false).unwrap();
            self.position = Some(id);
        }
        if self.tick == 3 {
            ctx.exit_market(self.position.unwrap(), None).unwrap();
        }
    }

    fn on_start(&mut self, _ctx: &mut Context<'_>) {
        self.callbacks.push("start".into());
    }

    fn on_finish(&mut self, _ctx: &mut Context<'_>, _bars: &Bars) {
        self.callbacks.push("finish".into());
    }

    fn on_enter_ok(&mut self, ctx: &mut Context<'_>, position: PositionId) {
        let position = ctx.position(position).unwrap();
        self.entry_shares = position.shares();
        self.callbacks.push("enter_ok".into());
    }

    fn on_exit_ok(&mut self, ctx: &mut Context<'_>, position: PositionId) {
        let position = ctx.position(position).unwrap();
        assert_eq!(position.state(), PositionState::Closed);
        self.exit_pnl = position.pnl(None, true);
        self.callbacks.push("exit_ok".into());
    }

    fn on_enter_canceled(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {
        self.callbacks.push("enter_canceled".into());
    }

    fn on_exit_canceled(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {
        self.callbacks.push("exit_canceled".into());
    }
}

#[test]
fn long_round_trip_through_the_session() {
    // Entry fills at 50, exit fills at 55: PnL 50 on 10 shares.
    let bars = vec![
        flat_bars(0, 50.0),
        flat_bars(1, 50.0), // tick 1: entry submitted
        flat_bars(2, 50.0), // tick 2: entry accepted + filled at 50
        flat_bars(3, 55.0), // tick 3: exit submitted
        flat_bars(4, 55.0), // tick 4: exit accepted + filled at 55
        flat_bars(5, 55.0),
    ];
    let mut session = Session::new(InMemoryFeed::new(bars), RoundTrip::default(), 1000.0);
    session.run().unwrap();

    let strategy = session.strategy();
    assert_eq!(
        strategy.callbacks,
        vec!["start", "enter_ok", "exit_ok", "finish"]
    );
    assert_eq!(strategy.entry_shares, 10.0);
    assert_eq!(strategy.exit_pnl, 50.0);

    // Closed positions leave the registry; the ledger is flat again.
    assert!(session.positions().is_empty());
    assert_eq!(session.broker().borrow().shares(INSTRUMENT), 0.0);
    assert_eq!(session.broker().borrow().cash(true).unwrap(), 1050.0);
    assert_eq!(session.result().unwrap(), 1050.0);
}

/// Cancels its entry before it can fill.
#[derive(Default)]
struct CancelEntry {
    tick: usize,
    position: Option<PositionId>,
    enter_canceled: bool,
}

impl Strategy for CancelEntry {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, _bars: &Bars) {
        self.tick += 1;
        if self.tick == 1 {
            // A limit far below the market never fills.
            let id = ctx
                .enter_long_limit(INSTRUMENT, 1.0, 10.0, true, false)
                .unwrap();
            self.position = Some(id);
        }
        if self.tick == 2 {
            ctx.cancel_entry(self.position.unwrap()).unwrap();
        }
    }

    fn on_enter_canceled(&mut self, ctx: &mut Context<'_>, position: PositionId) {
        assert_eq!(ctx.position(position).unwrap().shares(), 0.0);
        self.enter_canceled = true;
    }
}

#[test]
fn canceled_entry_closes_the_position() {
    let bars = (0..5).map(|day| flat_bars(day, 50.0)).collect();
    let mut session = Session::new(InMemoryFeed::new(bars), CancelEntry::default(), 1000.0);
    session.run().unwrap();

    assert!(session.strategy().enter_canceled);
    assert!(session.positions().is_empty());
    assert_eq!(session.broker().borrow().cash(true).unwrap(), 1000.0);
}

/// Exits with a non-GTC limit that expires, then retries at market.
#[derive(Default)]
struct RetryExit {
    tick: usize,
    position: Option<PositionId>,
    exit_cancels: usize,
    exited: bool,
}

impl Strategy for RetryExit {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, _bars: &Bars) {
        self.tick += 1;
        if self.tick == 1 {
            self.position = Some(ctx.enter_long(INSTRUMENT, 10.0, true, false).unwrap());
        }
        if self.tick == 3 {
            // Unreachable sell limit, day-only: it will expire.
            ctx.exit_limit(self.position.unwrap(), 1000.0, Some(false))
                .unwrap();
        }
    }

    fn on_exit_canceled(&mut self, ctx: &mut Context<'_>, position: PositionId) {
        self.exit_cancels += 1;
        // The position is still open; resubmit at market.
        assert_eq!(ctx.position(position).unwrap().state(), PositionState::Open);
        ctx.exit_market(position, None).unwrap();
    }

    fn on_exit_ok(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {
        self.exited = true;
    }
}

#[test]
fn expired_exit_can_be_resubmitted_from_the_callback() {
    let bars = (0..8).map(|day| flat_bars(day, 50.0)).collect();
    let mut session = Session::new(InMemoryFeed::new(bars), RetryExit::default(), 1000.0);
    session.run().unwrap();

    let strategy = session.strategy();
    assert_eq!(strategy.exit_cancels, 1);
    assert!(strategy.exited);
    assert!(session.positions().is_empty());
    assert_eq!(session.broker().borrow().shares(INSTRUMENT), 0.0);
}

/// Leaves a position open until the data runs out.
#[derive(Default)]
struct BuyAndHold {
    entered: bool,
}

impl Strategy for BuyAndHold {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, _bars: &Bars) {
        if !self.entered {
            ctx.enter_long(INSTRUMENT, 10.0, true, false).unwrap();
            self.entered = true;
        }
    }
}

#[test]
fn open_position_marks_to_market_in_the_result() {
    let bars = vec![
        flat_bars(0, 50.0),
        flat_bars(1, 50.0),
        flat_bars(2, 50.0), // entry fills at 50
        flat_bars(3, 60.0),
        flat_bars(4, 60.0),
    ];
    let mut session = Session::new(InMemoryFeed::new(bars), BuyAndHold::default(), 1000.0);
    session.run().unwrap();

    // Still open: one live position, marked at the latest completed bar.
    assert_eq!(session.positions().len(), 1);
    assert_eq!(session.broker().borrow().shares(INSTRUMENT), 10.0);
    assert_eq!(session.result().unwrap(), 500.0 + 10.0 * 60.0);
}
