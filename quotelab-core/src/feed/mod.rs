//! Bar feeds: the market-data boundary consumed by the broker and dispatcher.
//!
//! The engine never reads files or sockets; it consumes anything that
//! implements [`BarFeed`]. [`InMemoryFeed`] is the reference implementation:
//! a pre-loaded, replayable bar sequence.

pub mod synthetic;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use log::debug;

use crate::dispatch::{DispatchPriority, Subject};
use crate::domain::bar::{Bar, Bars};
use crate::event::EventBus;

/// One tick of market data: the bar sets either side of the advance.
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub datetime: DateTime<Utc>,
    pub prev_bars: Bars,
    pub current_bars: Bars,
}

/// Contract for sequential bar suppliers.
///
/// `advance` returns the event to publish instead of publishing it, so the
/// driver can release its borrow of the feed first; bar-event handlers are
/// then free to read back into the feed (e.g. for `last_bar` lookups).
pub trait BarFeed {
    /// Channel carrying one [`BarEvent`] per advance.
    fn bar_events(&self) -> EventBus<BarEvent>;

    /// Channel emitted when the feed rewinds to its start.
    fn reset_events(&self) -> EventBus<()>;

    /// Moves the cursor one tick forward. None at end-of-data.
    fn advance(&mut self) -> Option<BarEvent>;

    fn eof(&self) -> bool;

    /// Bar set at the cursor (the most recently emitted "current" set).
    fn current_bars(&self) -> Option<&Bars>;

    /// Bar set one position behind the cursor.
    fn last_bars(&self) -> Option<&Bars>;

    fn last_bar(&self, instrument: &str) -> Option<&Bar>;

    fn current_datetime(&self) -> Option<DateTime<Utc>>;

    fn instruments(&self) -> &[String];
}

/// Shared handle to a feed. The broker and the dispatch subjects all hold
/// clones of the same cell.
pub type SharedFeed = Rc<RefCell<dyn BarFeed>>;

/// Drives a shared feed as a dispatcher subject, publishing each advance on
/// the feed's bar-event channel.
pub struct FeedSubject {
    feed: SharedFeed,
}

impl FeedSubject {
    pub fn new(feed: SharedFeed) -> Self {
        Self { feed }
    }
}

impl Subject for FeedSubject {
    fn eof(&self) -> bool {
        self.feed.borrow().eof()
    }

    fn dispatch(&mut self) -> bool {
        let event = self.feed.borrow_mut().advance();
        match event {
            Some(event) => {
                let bus = self.feed.borrow().bar_events();
                bus.emit(&event);
                true
            }
            None => false,
        }
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::BarFeed
    }
}

/// Pre-loaded feed over an in-memory bar sequence.
///
/// The cursor starts on the first bar set; each advance emits the pair
/// (previous, current), so the first bar set only ever appears as a
/// "previous" and a feed needs at least two bar sets to emit anything.
pub struct InMemoryFeed {
    bars: Vec<Bars>,
    index: usize,
    instruments: Vec<String>,
    bar_events: EventBus<BarEvent>,
    reset_events: EventBus<()>,
}

impl InMemoryFeed {
    pub fn new(bars: Vec<Bars>) -> Self {
        let instruments: BTreeSet<String> = bars
            .iter()
            .flat_map(|set| set.instruments().map(str::to_string))
            .collect();
        Self {
            bars,
            index: 0,
            instruments: instruments.into_iter().collect(),
            bar_events: EventBus::new(),
            reset_events: EventBus::new(),
        }
    }

    /// Rewinds to the start and announces the reset.
    pub fn reset(&mut self) {
        debug!("feed reset to start ({} bar sets)", self.bars.len());
        self.index = 0;
        self.reset_events.emit(&());
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl BarFeed for InMemoryFeed {
    fn bar_events(&self) -> EventBus<BarEvent> {
        self.bar_events.clone()
    }

    fn reset_events(&self) -> EventBus<()> {
        self.reset_events.clone()
    }

    fn advance(&mut self) -> Option<BarEvent> {
        if self.eof() {
            return None;
        }
        self.index += 1;
        let current = self.bars[self.index].clone();
        let prev = self.bars[self.index - 1].clone();
        Some(BarEvent {
            datetime: current.datetime(),
            prev_bars: prev,
            current_bars: current,
        })
    }

    fn eof(&self) -> bool {
        self.bars.is_empty() || self.index + 1 >= self.bars.len()
    }

    fn current_bars(&self) -> Option<&Bars> {
        self.bars.get(self.index)
    }

    fn last_bars(&self) -> Option<&Bars> {
        if self.index == 0 {
            None
        } else {
            self.bars.get(self.index - 1)
        }
    }

    fn last_bar(&self, instrument: &str) -> Option<&Bar> {
        self.last_bars().and_then(|bars| bars.bar(instrument))
    }

    fn current_datetime(&self) -> Option<DateTime<Utc>> {
        self.current_bars().map(Bars::datetime)
    }

    fn instruments(&self) -> &[String] {
        &self.instruments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::Ohlc;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn bars_at(day: i64, price: f64) -> Bars {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        let ohlc = Ohlc {
            open: price,
            high: price,
            low: price,
            close: price,
        };
        let bar = Bar::new(start, start + Duration::days(1), ohlc, ohlc, 0.0).unwrap();
        let mut map = HashMap::new();
        map.insert("eurusd".to_string(), bar);
        Bars::new(map).unwrap()
    }

    #[test]
    fn advance_emits_prev_current_pairs() {
        let mut feed = InMemoryFeed::new(vec![bars_at(0, 1.0), bars_at(1, 2.0), bars_at(2, 3.0)]);
        assert!(!feed.eof());
        assert!(feed.last_bars().is_none());

        let first = feed.advance().unwrap();
        assert_eq!(first.prev_bars.bar("eurusd").unwrap().price(), 1.0);
        assert_eq!(first.current_bars.bar("eurusd").unwrap().price(), 2.0);
        assert!(!feed.eof());

        let second = feed.advance().unwrap();
        assert_eq!(second.prev_bars.bar("eurusd").unwrap().price(), 2.0);
        assert_eq!(second.current_bars.bar("eurusd").unwrap().price(), 3.0);
        assert!(feed.eof());
        assert!(feed.advance().is_none());
    }

    #[test]
    fn single_bar_feed_is_immediately_eof() {
        let mut feed = InMemoryFeed::new(vec![bars_at(0, 1.0)]);
        assert!(feed.eof());
        assert!(feed.advance().is_none());
    }

    #[test]
    fn last_bar_tracks_previous_set() {
        let mut feed = InMemoryFeed::new(vec![bars_at(0, 1.0), bars_at(1, 2.0)]);
        feed.advance().unwrap();
        assert_eq!(feed.last_bar("eurusd").unwrap().price(), 1.0);
        assert_eq!(
            feed.current_bars().unwrap().bar("eurusd").unwrap().price(),
            2.0
        );
    }

    #[test]
    fn reset_rewinds_and_notifies() {
        let mut feed = InMemoryFeed::new(vec![bars_at(0, 1.0), bars_at(1, 2.0)]);
        let resets = Rc::new(RefCell::new(0));
        {
            let resets = Rc::clone(&resets);
            feed.reset_events().subscribe(move |_| *resets.borrow_mut() += 1);
        }
        feed.advance().unwrap();
        assert!(feed.eof());

        feed.reset();
        assert_eq!(*resets.borrow(), 1);
        assert!(!feed.eof());
        assert!(feed.last_bars().is_none());
    }

    #[test]
    fn feed_subject_publishes_on_bar_events() {
        let feed: Rc<RefCell<InMemoryFeed>> = Rc::new(RefCell::new(InMemoryFeed::new(vec![
            bars_at(0, 1.0),
            bars_at(1, 2.0),
        ])));
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            feed.borrow()
                .bar_events()
                .subscribe(move |event: &BarEvent| seen.borrow_mut().push(event.datetime));
        }

        let shared: SharedFeed = feed;
        let mut subject = FeedSubject::new(shared);
        assert!(subject.dispatch());
        assert!(!subject.dispatch());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn instruments_are_collected_from_all_sets() {
        let feed = InMemoryFeed::new(vec![bars_at(0, 1.0)]);
        assert_eq!(feed.instruments(), ["eurusd".to_string()]);
    }
}
