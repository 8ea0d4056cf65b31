//! Strategy layer: user callbacks, the trading context, and the session
//! that wires feed, broker, and positions together.
//!
//! A [`Session`] owns one simulation run. The broker subscribes to the
//! feed's bar events ahead of the session, so matching for a tick settles
//! before the strategy's `on_bars` runs; order events collected from the
//! broker's channel are routed to positions and strategy callbacks at
//! deterministic points between callbacks.

pub mod position;
pub mod tracker;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use log::warn;
use thiserror::Error;

use crate::broker::commission::{Commission, NoCommission};
use crate::broker::{Broker, BrokerError, BrokerSubject, OrderEvent, SharedBroker};
use crate::dispatch::{Dispatcher, Step};
use crate::domain::bar::Bars;
use crate::domain::order::{Action, Order, OrderError, OrderId, Rounding};
use crate::feed::{BarEvent, BarFeed, FeedSubject, SharedFeed};

use position::{
    Direction, Position, PositionEffect, PositionError, PositionId, PositionRegistry,
    PositionState,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// User-implemented trading logic. Only `on_bars` is mandatory.
pub trait Strategy {
    /// Called once per tick with the current bar set. This is where trading
    /// decisions live.
    fn on_bars(&mut self, ctx: &mut Context<'_>, datetime: DateTime<Utc>, bars: &Bars);

    fn on_start(&mut self, _ctx: &mut Context<'_>) {}

    fn on_finish(&mut self, _ctx: &mut Context<'_>, _bars: &Bars) {}

    fn on_idle(&mut self, _ctx: &mut Context<'_>) {}

    fn on_order_updated(&mut self, _ctx: &mut Context<'_>, _order: &Order) {}

    fn on_enter_ok(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {}

    fn on_enter_canceled(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {}

    fn on_exit_ok(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {}

    fn on_exit_canceled(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {}
}

/// Trading operations and account queries available inside strategy
/// callbacks.
pub struct Context<'a> {
    broker: SharedBroker,
    feed: SharedFeed,
    positions: &'a mut PositionRegistry,
    order_index: &'a mut HashMap<OrderId, PositionId>,
}

impl<'a> Context<'a> {
    // ── Account queries ────────────────────────────────────────────────

    /// Ledger cash.
    pub fn cash(&self) -> Result<f64, BrokerError> {
        self.broker.borrow().cash(true)
    }

    /// Ledger cash; with `include_short` false, short-leg obligations are
    /// added back.
    pub fn available_cash(&self, include_short: bool) -> Result<f64, BrokerError> {
        self.broker.borrow().cash(include_short)
    }

    pub fn equity(&self) -> Result<f64, BrokerError> {
        self.broker.borrow().equity()
    }

    /// Signed share quantity held in an instrument.
    pub fn shares(&self, instrument: &str) -> f64 {
        self.broker.borrow().shares(instrument)
    }

    pub fn current_datetime(&self) -> Option<DateTime<Utc>> {
        self.feed.borrow().current_datetime()
    }

    /// Latest marking price for an instrument, if any bar has been seen.
    pub fn last_price(&self, instrument: &str) -> Option<f64> {
        self.feed.borrow().last_bar(instrument).map(|bar| bar.price())
    }

    /// Snapshot of a still-active order.
    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.broker.borrow().order(id).cloned()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn open_position_ids(&self) -> Vec<PositionId> {
        self.positions.ids()
    }

    // ── Raw orders ─────────────────────────────────────────────────────
    // Positive quantities buy, negative quantities sell.

    pub fn market_order(
        &mut self,
        instrument: &str,
        quantity: f64,
        fill_on_close: bool,
        good_till_canceled: bool,
    ) -> Result<OrderId, SessionError> {
        let (action, size) = signed_action(quantity)?;
        let mut broker = self.broker.borrow_mut();
        let mut order = broker.create_market_order(action, instrument, size, fill_on_close)?;
        order.set_good_till_canceled(good_till_canceled)?;
        Ok(broker.submit_order(order)?)
    }

    pub fn limit_order(
        &mut self,
        instrument: &str,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
    ) -> Result<OrderId, SessionError> {
        let (action, size) = signed_action(quantity)?;
        let mut broker = self.broker.borrow_mut();
        let mut order = broker.create_limit_order(action, instrument, limit_price, size)?;
        order.set_good_till_canceled(good_till_canceled)?;
        Ok(broker.submit_order(order)?)
    }

    pub fn stop_order(
        &mut self,
        instrument: &str,
        stop_price: f64,
        quantity: f64,
        good_till_canceled: bool,
    ) -> Result<OrderId, SessionError> {
        let (action, size) = signed_action(quantity)?;
        let mut broker = self.broker.borrow_mut();
        let mut order = broker.create_stop_order(action, instrument, stop_price, size)?;
        order.set_good_till_canceled(good_till_canceled)?;
        Ok(broker.submit_order(order)?)
    }

    pub fn stop_limit_order(
        &mut self,
        instrument: &str,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
    ) -> Result<OrderId, SessionError> {
        let (action, size) = signed_action(quantity)?;
        let mut broker = self.broker.borrow_mut();
        let mut order =
            broker.create_stop_limit_order(action, instrument, stop_price, limit_price, size)?;
        order.set_good_till_canceled(good_till_canceled)?;
        Ok(broker.submit_order(order)?)
    }

    pub fn cancel_order(&mut self, id: OrderId) -> Result<(), BrokerError> {
        self.broker.borrow_mut().cancel_order(id)
    }

    // ── Positions ──────────────────────────────────────────────────────

    pub fn enter_long(
        &mut self,
        instrument: &str,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Long,
            instrument,
            None,
            None,
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_short(
        &mut self,
        instrument: &str,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Short,
            instrument,
            None,
            None,
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_long_limit(
        &mut self,
        instrument: &str,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Long,
            instrument,
            None,
            Some(limit_price),
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_short_limit(
        &mut self,
        instrument: &str,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Short,
            instrument,
            None,
            Some(limit_price),
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_long_stop(
        &mut self,
        instrument: &str,
        stop_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Long,
            instrument,
            Some(stop_price),
            None,
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_short_stop(
        &mut self,
        instrument: &str,
        stop_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Short,
            instrument,
            Some(stop_price),
            None,
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_long_stop_limit(
        &mut self,
        instrument: &str,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Long,
            instrument,
            Some(stop_price),
            Some(limit_price),
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    pub fn enter_short_stop_limit(
        &mut self,
        instrument: &str,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        self.enter(
            Direction::Short,
            instrument,
            Some(stop_price),
            Some(limit_price),
            quantity,
            good_till_canceled,
            all_or_none,
        )
    }

    /// Closes a position at market.
    pub fn exit_market(
        &mut self,
        position: PositionId,
        good_till_canceled: Option<bool>,
    ) -> Result<(), SessionError> {
        self.exit(position, None, None, good_till_canceled)
    }

    pub fn exit_limit(
        &mut self,
        position: PositionId,
        limit_price: f64,
        good_till_canceled: Option<bool>,
    ) -> Result<(), SessionError> {
        self.exit(position, None, Some(limit_price), good_till_canceled)
    }

    pub fn exit_stop(
        &mut self,
        position: PositionId,
        stop_price: f64,
        good_till_canceled: Option<bool>,
    ) -> Result<(), SessionError> {
        self.exit(position, Some(stop_price), None, good_till_canceled)
    }

    pub fn exit_stop_limit(
        &mut self,
        position: PositionId,
        stop_price: f64,
        limit_price: f64,
        good_till_canceled: Option<bool>,
    ) -> Result<(), SessionError> {
        self.exit(position, Some(stop_price), Some(limit_price), good_till_canceled)
    }

    /// Cancels the entry order if it is still active.
    pub fn cancel_entry(&mut self, position: PositionId) -> Result<(), SessionError> {
        let position = self
            .positions
            .get(position)
            .ok_or(PositionError::Unknown(position))?;
        if position.entry_active() {
            let entry = position.entry_order();
            self.broker.borrow_mut().cancel_order(entry)?;
        }
        Ok(())
    }

    /// Cancels the exit order if it is still active.
    pub fn cancel_exit(&mut self, position: PositionId) -> Result<(), SessionError> {
        let position = self
            .positions
            .get(position)
            .ok_or(PositionError::Unknown(position))?;
        if position.exit_active() {
            if let Some(exit) = position.exit_order() {
                self.broker.borrow_mut().cancel_order(exit)?;
            }
        }
        Ok(())
    }

    fn enter(
        &mut self,
        direction: Direction,
        instrument: &str,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
        quantity: f64,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Result<PositionId, SessionError> {
        let action = match direction {
            Direction::Long => Action::Buy,
            Direction::Short => Action::SellShort,
        };
        let entry_id;
        let rounding;
        {
            let mut broker = self.broker.borrow_mut();
            let mut order =
                build_order(&broker, action, instrument, stop_price, limit_price, quantity)?;
            order.set_good_till_canceled(good_till_canceled)?;
            order.set_all_or_none(all_or_none)?;
            rounding = order.rounding();
            entry_id = broker.submit_order(order)?;
        }

        let position_id = self.positions.allocate();
        self.positions.register(Position::new(
            position_id,
            direction,
            instrument,
            entry_id,
            rounding,
            good_till_canceled,
            all_or_none,
        ));
        self.order_index.insert(entry_id, position_id);
        Ok(position_id)
    }

    fn exit(
        &mut self,
        position_id: PositionId,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
        good_till_canceled: Option<bool>,
    ) -> Result<(), SessionError> {
        let position = self
            .positions
            .get(position_id)
            .ok_or(PositionError::Unknown(position_id))?;

        match position.state() {
            // Already finished: nothing to exit.
            PositionState::Closed => Ok(()),
            PositionState::WaitingEntry => {
                // Nothing filled yet, so an exit request just cancels the
                // entry; the cancellation will close the position.
                let entry = position.entry_order();
                self.broker.borrow_mut().cancel_order(entry)?;
                Ok(())
            }
            PositionState::Open => {
                if position.exit_active() {
                    return Err(PositionError::ExitOrderActive.into());
                }
                let direction = position.direction();
                let shares = position.shares();
                let instrument = position.instrument().to_string();
                let entry = position.entry_order();
                let entry_active = position.entry_active();
                let good_till_canceled =
                    good_till_canceled.unwrap_or(position.good_till_canceled());
                let all_or_none = position.all_or_none();

                // An active entry remainder is canceled before the exit goes in.
                if entry_active {
                    self.broker.borrow_mut().cancel_order(entry)?;
                }

                let (action, quantity) = match direction {
                    Direction::Long => (Action::Sell, shares),
                    Direction::Short => (Action::BuyToCover, -shares),
                };
                let exit_id;
                {
                    let mut broker = self.broker.borrow_mut();
                    let mut order = build_order(
                        &broker,
                        action,
                        &instrument,
                        stop_price,
                        limit_price,
                        quantity,
                    )?;
                    order.set_good_till_canceled(good_till_canceled)?;
                    order.set_all_or_none(all_or_none)?;
                    exit_id = broker.submit_order(order)?;
                }
                self.order_index.insert(exit_id, position_id);
                if let Some(position) = self.positions.get_mut(position_id) {
                    position.set_exit_order(exit_id);
                }
                Ok(())
            }
        }
    }
}

fn signed_action(quantity: f64) -> Result<(Action, f64), OrderError> {
    if quantity > 0.0 {
        Ok((Action::Buy, quantity))
    } else if quantity < 0.0 {
        Ok((Action::Sell, -quantity))
    } else {
        Err(OrderError::InvalidQuantity(quantity))
    }
}

fn build_order(
    broker: &Broker,
    action: Action,
    instrument: &str,
    stop_price: Option<f64>,
    limit_price: Option<f64>,
    quantity: f64,
) -> Result<Order, OrderError> {
    match (stop_price, limit_price) {
        (None, None) => broker.create_market_order(action, instrument, quantity, false),
        (None, Some(limit)) => broker.create_limit_order(action, instrument, limit, quantity),
        (Some(stop), None) => broker.create_stop_order(action, instrument, stop, quantity),
        (Some(stop), Some(limit)) => {
            broker.create_stop_limit_order(action, instrument, stop, limit, quantity)
        }
    }
}

/// Owns one simulation run: feed, broker, positions, and the user strategy.
pub struct Session<S: Strategy> {
    strategy: S,
    broker: SharedBroker,
    feed: SharedFeed,
    positions: PositionRegistry,
    order_index: HashMap<OrderId, PositionId>,
    order_queue: Rc<RefCell<VecDeque<OrderEvent>>>,
    bar_queue: Rc<RefCell<VecDeque<BarEvent>>>,
    broker_errors: Rc<RefCell<Vec<BrokerError>>>,
}

impl<S: Strategy> Session<S> {
    pub fn new(feed: impl BarFeed + 'static, strategy: S, initial_cash: f64) -> Self {
        Self::with_commission(feed, strategy, initial_cash, Box::new(NoCommission))
    }

    pub fn with_commission(
        feed: impl BarFeed + 'static,
        strategy: S,
        initial_cash: f64,
        commission: Box<dyn Commission>,
    ) -> Self {
        Self::with_commission_and_rounding(
            feed,
            strategy,
            initial_cash,
            commission,
            Rounding::default(),
        )
    }

    pub fn with_commission_and_rounding(
        feed: impl BarFeed + 'static,
        strategy: S,
        initial_cash: f64,
        commission: Box<dyn Commission>,
        rounding: Rounding,
    ) -> Self {
        let feed: SharedFeed = Rc::new(RefCell::new(feed));
        let broker = Rc::new(RefCell::new(Broker::new(
            Rc::clone(&feed),
            initial_cash,
            commission,
            rounding,
        )));

        // The broker listens first so matching for a tick settles before
        // the session routes anything to the strategy.
        let broker_errors: Rc<RefCell<Vec<BrokerError>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let broker = Rc::clone(&broker);
            let errors = Rc::clone(&broker_errors);
            feed.borrow().bar_events().subscribe(move |event: &BarEvent| {
                if let Err(err) = broker
                    .borrow_mut()
                    .on_bars(&event.prev_bars, &event.current_bars)
                {
                    errors.borrow_mut().push(err);
                }
            });
        }
        {
            let broker = Rc::clone(&broker);
            feed.borrow()
                .reset_events()
                .subscribe(move |_| broker.borrow_mut().reset());
        }

        let bar_queue: Rc<RefCell<VecDeque<BarEvent>>> = Rc::new(RefCell::new(VecDeque::new()));
        {
            let queue = Rc::clone(&bar_queue);
            feed.borrow()
                .bar_events()
                .subscribe(move |event: &BarEvent| queue.borrow_mut().push_back(event.clone()));
        }

        let order_queue: Rc<RefCell<VecDeque<OrderEvent>>> =
            Rc::new(RefCell::new(VecDeque::new()));
        {
            let queue = Rc::clone(&order_queue);
            broker
                .borrow()
                .order_events()
                .subscribe(move |event: &OrderEvent| queue.borrow_mut().push_back(event.clone()));
        }

        Self {
            strategy,
            broker,
            feed,
            positions: PositionRegistry::new(),
            order_index: HashMap::new(),
            order_queue,
            bar_queue,
            broker_errors,
        }
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    pub fn feed(&self) -> &SharedFeed {
        &self.feed
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    pub fn into_strategy(self) -> S {
        self.strategy
    }

    pub fn positions(&self) -> &PositionRegistry {
        &self.positions
    }

    /// Final portfolio value.
    pub fn result(&self) -> Result<f64, BrokerError> {
        self.broker.borrow().equity()
    }

    /// Runs the simulation to end-of-data. Returns the first engine
    /// invariant violation, if any; domain-expected conditions never abort
    /// the run.
    pub fn run(&mut self) -> Result<(), SessionError> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_subject(Box::new(BrokerSubject::new(Rc::clone(&self.broker))));
        dispatcher.add_subject(Box::new(FeedSubject::new(Rc::clone(&self.feed))));
        dispatcher.start();

        {
            let Self {
                strategy,
                broker,
                feed,
                positions,
                order_index,
                ..
            } = self;
            let mut ctx = Context {
                broker: Rc::clone(broker),
                feed: Rc::clone(feed),
                positions,
                order_index,
            };
            strategy.on_start(&mut ctx);
        }
        self.route_order_events()?;

        loop {
            self.check_broker_errors()?;
            match dispatcher.step() {
                Step::Eof => break,
                Step::Dispatched => {
                    self.check_broker_errors()?;
                    self.route_order_events()?;
                    loop {
                        let bar_event = self.bar_queue.borrow_mut().pop_front();
                        let Some(bar_event) = bar_event else { break };
                        {
                            let Self {
                                strategy,
                                broker,
                                feed,
                                positions,
                                order_index,
                                ..
                            } = self;
                            let mut ctx = Context {
                                broker: Rc::clone(broker),
                                feed: Rc::clone(feed),
                                positions,
                                order_index,
                            };
                            strategy.on_bars(&mut ctx, bar_event.datetime, &bar_event.current_bars);
                        }
                        self.route_order_events()?;
                    }
                }
                Step::Idle => {
                    let Self {
                        strategy,
                        broker,
                        feed,
                        positions,
                        order_index,
                        ..
                    } = self;
                    let mut ctx = Context {
                        broker: Rc::clone(broker),
                        feed: Rc::clone(feed),
                        positions,
                        order_index,
                    };
                    strategy.on_idle(&mut ctx);
                }
            }
        }
        dispatcher.finish();

        let last_bars = self.feed.borrow().last_bars().cloned();
        match last_bars {
            Some(bars) => {
                let Self {
                    strategy,
                    broker,
                    feed,
                    positions,
                    order_index,
                    ..
                } = self;
                let mut ctx = Context {
                    broker: Rc::clone(broker),
                    feed: Rc::clone(feed),
                    positions,
                    order_index,
                };
                strategy.on_finish(&mut ctx, &bars);
            }
            None => warn!("bar feed produced no bars"),
        }
        self.route_order_events()?;
        Ok(())
    }

    fn check_broker_errors(&mut self) -> Result<(), SessionError> {
        let err = self.broker_errors.borrow_mut().drain(..).next();
        match err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Drains queued order events, routing each to the strategy and to its
    /// position (if any). Callbacks may submit or cancel orders, so the
    /// queue is drained until empty.
    fn route_order_events(&mut self) -> Result<(), SessionError> {
        loop {
            let event = self.order_queue.borrow_mut().pop_front();
            let Some(event) = event else { break };

            {
                let Self {
                    strategy,
                    broker,
                    feed,
                    positions,
                    order_index,
                    ..
                } = self;
                let mut ctx = Context {
                    broker: Rc::clone(broker),
                    feed: Rc::clone(feed),
                    positions,
                    order_index,
                };
                strategy.on_order_updated(&mut ctx, &event.order);
            }

            let Some(order_id) = event.order.id() else { continue };
            let Some(&position_id) = self.order_index.get(&order_id) else {
                continue;
            };
            if !event.order.is_active() {
                self.order_index.remove(&order_id);
            }

            let effect = match self.positions.get_mut(position_id) {
                Some(position) => position.on_order_event(&event)?,
                None => return Err(PositionError::Unknown(position_id).into()),
            };

            if let Some(effect) = effect {
                let Self {
                    strategy,
                    broker,
                    feed,
                    positions,
                    order_index,
                    ..
                } = self;
                let mut ctx = Context {
                    broker: Rc::clone(broker),
                    feed: Rc::clone(feed),
                    positions,
                    order_index,
                };
                match effect {
                    PositionEffect::EnterOk => strategy.on_enter_ok(&mut ctx, position_id),
                    PositionEffect::EnterCanceled => {
                        strategy.on_enter_canceled(&mut ctx, position_id)
                    }
                    PositionEffect::ExitOk => strategy.on_exit_ok(&mut ctx, position_id),
                    PositionEffect::ExitCanceled => {
                        strategy.on_exit_canceled(&mut ctx, position_id)
                    }
                }
            }

            // Closed positions leave the registry once their callback has
            // had a chance to inspect them.
            let closed = self
                .positions
                .get(position_id)
                .map_or(false, |position| position.state() == PositionState::Closed);
            if closed {
                self.positions.remove(position_id);
            }
        }
        Ok(())
    }
}
