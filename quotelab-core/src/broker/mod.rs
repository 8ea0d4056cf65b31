//! Backtest broker: order registry, bar-pair matching, cash and position
//! ledger.
//!
//! The broker owns every submitted order. Once per tick it matches its
//! active orders against the (previous, current) bar pair, commits any
//! resulting executions against the cash ledger, and announces each order
//! transition on its order-event channel. All of its work happens while
//! handling feed bar events; its own dispatch slot is a no-op.

pub mod commission;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;

use crate::dispatch::{DispatchPriority, Subject};
use crate::domain::bar::Bars;
use crate::domain::fill::FillInfo;
use crate::domain::order::{
    Action, Execution, Order, OrderError, OrderId, OrderType, Rounding,
};
use crate::event::EventBus;
use crate::feed::SharedFeed;

use commission::Commission;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("the order was already processed")]
    AlreadyProcessed,

    #[error("order {0} is not active anymore")]
    NotActive(OrderId),

    #[error("can't cancel order {0}: it has already been filled")]
    AlreadyFilled(OrderId),

    #[error("price for {0} is missing")]
    MissingPrice(String),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Why an order event fired.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEventKind {
    Submitted,
    Accepted,
    Canceled { reason: String },
    PartiallyFilled,
    Filled,
}

/// Snapshot notification emitted on every order transition.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    /// Copy of the order as of this transition.
    pub order: Order,
    pub kind: OrderEventKind,
    /// The fill behind a `Filled`/`PartiallyFilled` event.
    pub execution: Option<Execution>,
}

/// Shared handle to a broker, as held by dispatch subjects and sessions.
pub type SharedBroker = Rc<RefCell<Broker>>;

pub struct Broker {
    cash: f64,
    initial_cash: f64,
    next_order_id: u64,
    // BTreeMap keeps matching in submission order, tick after tick.
    active_orders: BTreeMap<OrderId, Order>,
    quantities: HashMap<String, f64>,
    commission: Box<dyn Commission>,
    rounding: Rounding,
    feed: SharedFeed,
    order_events: EventBus<OrderEvent>,
    started: bool,
}

impl Broker {
    pub fn new(
        feed: SharedFeed,
        cash: f64,
        commission: Box<dyn Commission>,
        rounding: Rounding,
    ) -> Self {
        let quantities = feed
            .borrow()
            .instruments()
            .iter()
            .map(|instrument| (instrument.clone(), 0.0))
            .collect();
        Self {
            cash,
            initial_cash: cash,
            next_order_id: 0,
            active_orders: BTreeMap::new(),
            quantities,
            commission,
            rounding,
            feed,
            order_events: EventBus::new(),
            started: false,
        }
    }

    /// Channel announcing every order transition.
    pub fn order_events(&self) -> EventBus<OrderEvent> {
        self.order_events.clone()
    }

    pub fn current_datetime(&self) -> Option<DateTime<Utc>> {
        self.feed.borrow().current_datetime()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    /// Nothing left to do once the feed has run dry; all broker work happens
    /// while feed events are being handled.
    pub fn eof(&self) -> bool {
        self.feed.borrow().eof()
    }

    // ── Ledger queries ─────────────────────────────────────────────────

    /// Ledger cash. With `include_short` false, the mark-to-market value of
    /// short legs is added back, yielding cash available ignoring the
    /// obligation to cover them.
    pub fn cash(&self, include_short: bool) -> Result<f64, BrokerError> {
        let mut ret = self.cash;
        if !include_short {
            let feed = self.feed.borrow();
            if let Some(bars) = feed.current_bars() {
                for (instrument, shares) in &self.quantities {
                    if *shares < 0.0 {
                        let bar = bars
                            .bar(instrument)
                            .or_else(|| feed.last_bar(instrument))
                            .ok_or_else(|| BrokerError::MissingPrice(instrument.clone()))?;
                        ret += bar.in_price() * *shares;
                    }
                }
            }
        }
        Ok(ret)
    }

    /// Portfolio value: cash plus every open quantity at its latest
    /// sell-side price. A missing price for an open position is a fatal
    /// error; silently dropping the leg would corrupt the accounting.
    pub fn equity(&self) -> Result<f64, BrokerError> {
        let mut ret = self.cash(true)?;
        let feed = self.feed.borrow();
        for (instrument, shares) in &self.quantities {
            if *shares == 0.0 {
                continue;
            }
            let bar = feed
                .last_bar(instrument)
                .ok_or_else(|| BrokerError::MissingPrice(instrument.clone()))?;
            ret += bar.out_price() * *shares;
        }
        Ok(ret)
    }

    /// Signed share quantity for one instrument.
    pub fn shares(&self, instrument: &str) -> f64 {
        self.quantities.get(instrument).copied().unwrap_or(0.0)
    }

    pub fn quantities(&self) -> &HashMap<String, f64> {
        &self.quantities
    }

    /// Instruments with a nonzero position.
    pub fn active_instruments(&self) -> Vec<&str> {
        self.quantities
            .iter()
            .filter(|(_, shares)| **shares != 0.0)
            .map(|(instrument, _)| instrument.as_str())
            .collect()
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.active_orders.get(&id)
    }

    pub fn active_orders(&self, instrument: Option<&str>) -> Vec<&Order> {
        self.active_orders
            .values()
            .filter(|order| instrument.map_or(true, |name| order.instrument() == name))
            .collect()
    }

    // ── Order factories ────────────────────────────────────────────────

    pub fn create_market_order(
        &self,
        action: Action,
        instrument: &str,
        quantity: f64,
        fill_on_close: bool,
    ) -> Result<Order, OrderError> {
        Order::new(
            OrderType::Market { fill_on_close },
            action,
            instrument,
            quantity,
            self.rounding,
        )
    }

    pub fn create_limit_order(
        &self,
        action: Action,
        instrument: &str,
        limit_price: f64,
        quantity: f64,
    ) -> Result<Order, OrderError> {
        Order::new(
            OrderType::Limit { limit_price },
            action,
            instrument,
            quantity,
            self.rounding,
        )
    }

    pub fn create_stop_order(
        &self,
        action: Action,
        instrument: &str,
        stop_price: f64,
        quantity: f64,
    ) -> Result<Order, OrderError> {
        Order::new(
            OrderType::Stop {
                stop_price,
                stop_hit: false,
            },
            action,
            instrument,
            quantity,
            self.rounding,
        )
    }

    pub fn create_stop_limit_order(
        &self,
        action: Action,
        instrument: &str,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
    ) -> Result<Order, OrderError> {
        Order::new(
            OrderType::StopLimit {
                stop_price,
                limit_price,
                stop_hit: false,
            },
            action,
            instrument,
            quantity,
            self.rounding,
        )
    }

    // ── Order protocol ─────────────────────────────────────────────────

    /// Registers an order, stamping its id and submission time. Legal only
    /// for orders in the Initial state.
    pub fn submit_order(&mut self, mut order: Order) -> Result<OrderId, BrokerError> {
        if !order.is_initial() {
            return Err(BrokerError::AlreadyProcessed);
        }
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        order.submitted(id, self.current_datetime());
        debug!("BROKER: submitted {order} as order {id}");
        self.active_orders.insert(id, order.clone());
        self.notify(OrderEvent {
            order,
            kind: OrderEventKind::Submitted,
            execution: None,
        });
        Ok(id)
    }

    /// Cancels a still-active order. Canceling an unknown/terminal order is
    /// an error, never a silent no-op.
    pub fn cancel_order(&mut self, id: OrderId) -> Result<(), BrokerError> {
        let mut order = self
            .active_orders
            .remove(&id)
            .ok_or(BrokerError::NotActive(id))?;
        if order.is_filled() {
            self.active_orders.insert(id, order);
            return Err(BrokerError::AlreadyFilled(id));
        }
        order.canceled(self.current_datetime());
        debug!("BROKER: canceled order {id} on user request");
        self.notify(OrderEvent {
            order,
            kind: OrderEventKind::Canceled {
                reason: "User requested cancellation".to_string(),
            },
            execution: None,
        });
        Ok(())
    }

    /// Matches every active order against the tick's bar pair. Runs on a
    /// frozen snapshot so orders submitted or canceled by event handlers do
    /// not join this tick.
    pub fn on_bars(&mut self, prev_bars: &Bars, cur_bars: &Bars) -> Result<(), BrokerError> {
        let snapshot: Vec<OrderId> = self.active_orders.keys().copied().collect();
        for id in snapshot {
            self.process_active_order(id, prev_bars, cur_bars)?;
        }
        Ok(())
    }

    /// Restores the broker to its initial ledger; paired with a feed rewind.
    pub fn reset(&mut self) {
        self.started = false;
        self.cash = self.initial_cash;
        self.next_order_id = 0;
        self.active_orders.clear();
        self.quantities = self
            .feed
            .borrow()
            .instruments()
            .iter()
            .map(|instrument| (instrument.clone(), 0.0))
            .collect();
    }

    // ── Matching internals ─────────────────────────────────────────────

    fn process_active_order(
        &mut self,
        id: OrderId,
        prev_bars: &Bars,
        cur_bars: &Bars,
    ) -> Result<(), BrokerError> {
        // A handler reacting to an earlier order this tick may have
        // canceled this one already.
        let Some(order) = self.active_orders.get(&id) else {
            return Ok(());
        };
        let instrument = order.instrument().to_string();

        // With multiple instruments, an order whose instrument has no bar in
        // either set sits out the tick, exactly as if its market were closed.
        let (Some(prev_bar), Some(cur_bar)) = (prev_bars.bar(&instrument), cur_bars.bar(&instrument))
        else {
            return Ok(());
        };

        // Submitted -> Accepted exactly one tick after submission.
        if self
            .active_orders
            .get(&id)
            .is_some_and(|order| order.is_submitted())
        {
            let accepted_at = cur_bar.start();
            if let Some(order) = self.active_orders.get_mut(&id) {
                order.accepted(accepted_at);
            }
            if let Some(order) = self.active_orders.get(&id).cloned() {
                self.notify(OrderEvent {
                    order,
                    kind: OrderEventKind::Accepted,
                    execution: None,
                });
            }
        }

        let Some(order) = self.active_orders.get(&id) else {
            return Ok(());
        };
        if !order.is_active() {
            return Ok(());
        }

        // Non-GTC orders expire, before any fill attempt, once the session
        // has moved past their acceptance date.
        if !order.good_till_canceled() {
            let expired = order
                .accepted_at()
                .is_some_and(|accepted| prev_bar.session_date() > accepted.date_naive());
            if expired {
                let Some(mut order) = self.active_orders.remove(&id) else {
                    return Ok(());
                };
                order.canceled(Some(cur_bar.start()));
                debug!("BROKER: order {id} expired at session {}", prev_bar.session_date());
                self.notify(OrderEvent {
                    order,
                    kind: OrderEventKind::Canceled {
                        reason: "Expired".to_string(),
                    },
                    execution: None,
                });
                return Ok(());
            }
        }

        // Trigger evaluation latches stop state, so it runs on the
        // registered order, not a copy.
        let fill = self
            .active_orders
            .get_mut(&id)
            .and_then(|order| order.process(prev_bar, cur_bar));
        if let Some(fill) = fill {
            self.commit_execution(id, fill, cur_bar.start())?;
        }
        Ok(())
    }

    /// Tries to commit one execution. Fills that would drive cash negative
    /// are skipped; the order stays active for a later tick.
    fn commit_execution(
        &mut self,
        id: OrderId,
        fill: FillInfo,
        datetime: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let Some(order) = self.active_orders.get(&id) else {
            return Ok(());
        };
        let price = fill.price();
        let quantity = fill.quantity();
        let is_buy = order.action().is_buy();
        let instrument = order.instrument().to_string();
        let rounding = order.rounding();

        let signed_cost = if is_buy {
            -price * quantity
        } else {
            price * quantity
        };
        let commission = self.commission.calculate(order, price, quantity);
        let resulting_cash = self.cash + signed_cost - commission;

        if resulting_cash < 0.0 {
            debug!(
                "BROKER: not enough cash to fill {} order [{}] for {} share/s",
                instrument,
                id,
                order.remaining()
            );
            return Ok(());
        }

        let execution = Execution {
            price,
            quantity,
            commission,
            datetime,
        };
        let Some(order) = self.active_orders.get_mut(&id) else {
            return Ok(());
        };
        order.execute(execution.clone())?;

        self.cash = resulting_cash;
        let shares_delta = if is_buy { quantity } else { -quantity };
        let entry = self.quantities.entry(instrument.clone()).or_insert(0.0);
        *entry = rounding.apply(*entry + shares_delta);
        debug!(
            "BROKER: filled {quantity} {instrument} at {price} on order {id}, cash now {}",
            self.cash
        );

        let filled = self
            .active_orders
            .get(&id)
            .is_some_and(|order| order.is_filled());
        if filled {
            let Some(order) = self.active_orders.remove(&id) else {
                return Ok(());
            };
            self.notify(OrderEvent {
                order,
                kind: OrderEventKind::Filled,
                execution: Some(execution),
            });
        } else if let Some(order) = self.active_orders.get(&id).cloned() {
            self.notify(OrderEvent {
                order,
                kind: OrderEventKind::PartiallyFilled,
                execution: Some(execution),
            });
        }
        Ok(())
    }

    fn notify(&self, event: OrderEvent) {
        self.order_events.emit(&event);
    }
}

/// Dispatcher subject for a shared broker. All broker work happens while
/// handling feed bar events, so dispatch itself is a no-op; the subject
/// exists to anchor the broker-before-feed ordering and the end condition.
pub struct BrokerSubject {
    broker: SharedBroker,
}

impl BrokerSubject {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }
}

impl Subject for BrokerSubject {
    fn start(&mut self) {
        self.broker.borrow_mut().set_started(true);
    }

    fn stop(&mut self) {
        self.broker.borrow_mut().set_started(false);
    }

    fn eof(&self) -> bool {
        self.broker.borrow().eof()
    }

    fn dispatch(&mut self) -> bool {
        false
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Broker
    }
}
