//! Orders: lifecycle record, closed type variants, derived state.
//!
//! An order's state is never stored directly. It is computed from the
//! lifecycle record (id assignment, acceptance stamp, cancellation record,
//! execution list), so the state can never drift from the data it
//! summarizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::bar::Bar;
use super::fill::{self, FillInfo};

/// What an order does to the position when it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    BuyToCover,
    Sell,
    SellShort,
}

impl Action {
    pub fn is_buy(self) -> bool {
        matches!(self, Action::Buy | Action::BuyToCover)
    }

    pub fn is_sell(self) -> bool {
        !self.is_buy()
    }
}

/// Identifier assigned by the broker at submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quantity rounding applied to share deltas so repeated float arithmetic
/// cannot drift a position away from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rounding {
    /// Truncate toward zero to whole shares.
    WholeShares,
    /// Round half away from zero to the given number of decimal places.
    Decimals(u32),
    /// Keep quantities as-is.
    Exact,
}

impl Rounding {
    pub fn apply(self, quantity: f64) -> f64 {
        match self {
            Rounding::WholeShares => quantity.trunc(),
            Rounding::Decimals(places) => {
                let factor = 10f64.powi(places as i32);
                (quantity * factor).round() / factor
            }
            Rounding::Exact => quantity,
        }
    }
}

impl Default for Rounding {
    fn default() -> Self {
        Rounding::WholeShares
    }
}

/// One fill: price, quantity, commission, simulation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub datetime: DateTime<Utc>,
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - Price: {} - Amount: {} - Fee: {}",
            self.datetime, self.price, self.quantity, self.commission
        )
    }
}

/// Order variants and their trigger bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fills unconditionally at the current bar's open (or close).
    Market { fill_on_close: bool },
    /// Fills only once the limit price is crossed through the session.
    Limit { limit_price: f64 },
    /// Fires when the stop price is penetrated; guaranteed to fill once hit.
    Stop { stop_price: f64, stop_hit: bool },
    /// Stop trigger gating a limit fill.
    StopLimit {
        stop_price: f64,
        limit_price: f64,
        stop_hit: bool,
    },
}

/// Derived lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Initial,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order quantity must be positive, got {0}")]
    InvalidQuantity(f64),

    #[error("execution quantity {quantity} exceeds remaining {remaining}")]
    ExecutionExceedsRemaining { quantity: f64, remaining: f64 },

    #[error("execution quantity must be positive, got {0}")]
    NonPositiveExecution(f64),

    #[error("order flags can only change in the initial state")]
    NotInitial,
}

/// A request to trade, owned by the broker once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: Option<OrderId>,
    order_type: OrderType,
    action: Action,
    instrument: String,
    quantity: f64,
    rounding: Rounding,
    executions: Vec<Execution>,
    submitted_at: Option<DateTime<Utc>>,
    accepted_at: Option<DateTime<Utc>>,
    canceled: bool,
    canceled_at: Option<DateTime<Utc>>,
    good_till_canceled: bool,
    all_or_none: bool,
}

impl Order {
    pub fn new(
        order_type: OrderType,
        action: Action,
        instrument: impl Into<String>,
        quantity: f64,
        rounding: Rounding,
    ) -> Result<Self, OrderError> {
        if quantity <= 0.0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        Ok(Self {
            id: None,
            order_type,
            action,
            instrument: instrument.into(),
            quantity,
            rounding,
            executions: Vec::new(),
            submitted_at: None,
            accepted_at: None,
            canceled: false,
            canceled_at: None,
            good_till_canceled: false,
            all_or_none: false,
        })
    }

    // ── Derived state ──────────────────────────────────────────────────

    /// Current lifecycle state, computed from the lifecycle record.
    pub fn state(&self) -> OrderState {
        if self.canceled {
            OrderState::Canceled
        } else if self.remaining() <= 0.0 {
            OrderState::Filled
        } else if !self.executions.is_empty() {
            OrderState::PartiallyFilled
        } else if self.accepted_at.is_some() {
            OrderState::Accepted
        } else if self.id.is_some() {
            OrderState::Submitted
        } else {
            OrderState::Initial
        }
    }

    pub fn is_initial(&self) -> bool {
        self.state() == OrderState::Initial
    }

    pub fn is_submitted(&self) -> bool {
        self.state() == OrderState::Submitted
    }

    pub fn is_accepted(&self) -> bool {
        self.state() == OrderState::Accepted
    }

    pub fn is_partially_filled(&self) -> bool {
        self.state() == OrderState::PartiallyFilled
    }

    pub fn is_filled(&self) -> bool {
        self.state() == OrderState::Filled
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == OrderState::Canceled
    }

    /// Not canceled and not filled.
    pub fn is_active(&self) -> bool {
        !matches!(self.state(), OrderState::Canceled | OrderState::Filled)
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn id(&self) -> Option<OrderId> {
        self.id
    }

    pub fn order_type(&self) -> &OrderType {
        &self.order_type
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn rounding(&self) -> Rounding {
        self.rounding
    }

    pub fn executions(&self) -> &[Execution] {
        &self.executions
    }

    /// Quantity filled so far: the sum of execution quantities.
    pub fn filled(&self) -> f64 {
        self.executions.iter().map(|execution| execution.quantity).sum()
    }

    pub fn remaining(&self) -> f64 {
        self.quantity - self.filled()
    }

    /// Volume-weighted average fill price, when anything has filled.
    pub fn avg_fill_price(&self) -> Option<f64> {
        let filled = self.filled();
        (filled > 0.0).then(|| self.filled_cost() / filled)
    }

    /// Total notional of all fills.
    pub fn filled_cost(&self) -> f64 {
        self.executions
            .iter()
            .map(|execution| execution.price * execution.quantity)
            .sum()
    }

    pub fn total_commission(&self) -> f64 {
        self.executions
            .iter()
            .map(|execution| execution.commission)
            .sum()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn accepted_at(&self) -> Option<DateTime<Utc>> {
        self.accepted_at
    }

    pub fn canceled_at(&self) -> Option<DateTime<Utc>> {
        self.canceled_at
    }

    /// When the order finished filling, if it did.
    pub fn finish_datetime(&self) -> Option<DateTime<Utc>> {
        self.is_filled()
            .then(|| self.executions.last().map(|execution| execution.datetime))
            .flatten()
    }

    pub fn good_till_canceled(&self) -> bool {
        self.good_till_canceled
    }

    pub fn all_or_none(&self) -> bool {
        self.all_or_none
    }

    // ── Flags (Initial state only) ─────────────────────────────────────

    pub fn set_good_till_canceled(&mut self, value: bool) -> Result<(), OrderError> {
        if !self.is_initial() {
            return Err(OrderError::NotInitial);
        }
        self.good_till_canceled = value;
        Ok(())
    }

    pub fn set_all_or_none(&mut self, value: bool) -> Result<(), OrderError> {
        if !self.is_initial() {
            return Err(OrderError::NotInitial);
        }
        self.all_or_none = value;
        Ok(())
    }

    // ── Lifecycle transitions (broker-driven) ──────────────────────────

    pub fn submitted(&mut self, id: OrderId, at: Option<DateTime<Utc>>) {
        self.id = Some(id);
        self.submitted_at = at;
    }

    pub fn accepted(&mut self, at: DateTime<Utc>) {
        self.accepted_at = Some(at);
    }

    pub fn canceled(&mut self, at: Option<DateTime<Utc>>) {
        self.canceled = true;
        self.canceled_at = at;
    }

    /// Records a fill. The caller guarantees the quantity fits the order.
    pub fn execute(&mut self, execution: Execution) -> Result<(), OrderError> {
        if execution.quantity <= 0.0 {
            return Err(OrderError::NonPositiveExecution(execution.quantity));
        }
        let remaining = self.remaining();
        if execution.quantity > remaining {
            return Err(OrderError::ExecutionExceedsRemaining {
                quantity: execution.quantity,
                remaining,
            });
        }
        self.executions.push(execution);
        Ok(())
    }

    // ── Fill trigger ───────────────────────────────────────────────────

    /// Evaluates this order against a (previous, current) bar pair and
    /// returns the candidate fill, if any. Stop variants latch their
    /// trigger flag here.
    pub fn process(&mut self, prev: &Bar, cur: &Bar) -> Option<FillInfo> {
        let action = self.action;
        let quantity = self.quantity;
        match &mut self.order_type {
            OrderType::Market { fill_on_close } => {
                let price = match (*fill_on_close, action.is_buy()) {
                    (true, true) => cur.ask().close,
                    (true, false) => cur.bid().close,
                    (false, true) => cur.ask().open,
                    (false, false) => cur.bid().open,
                };
                Some(FillInfo::new(price, quantity))
            }
            OrderType::Limit { limit_price } => {
                fill::limit_price_trigger(action, *limit_price, prev, cur)
                    .map(|price| FillInfo::new(price, quantity))
            }
            OrderType::Stop {
                stop_price,
                stop_hit,
            } => {
                let mut trigger = None;
                if !*stop_hit {
                    trigger = fill::stop_price_trigger(action, *stop_price, prev, cur);
                    if trigger.is_some() {
                        *stop_hit = true;
                    }
                }
                if !*stop_hit {
                    return None;
                }
                // Intrabar data is often missing, so a hit stop fills its
                // full size at the trigger price or the current open.
                let price = trigger.unwrap_or(if action.is_buy() {
                    cur.ask().open
                } else {
                    cur.bid().open
                });
                Some(FillInfo::new(price, quantity))
            }
            OrderType::StopLimit {
                stop_price,
                limit_price,
                stop_hit,
            } => {
                let mut trigger = None;
                if !*stop_hit {
                    trigger = fill::stop_price_trigger(action, *stop_price, prev, cur);
                    if trigger.is_some() {
                        *stop_hit = true;
                    }
                }
                if !*stop_hit {
                    return None;
                }
                let limit = fill::limit_price_trigger(action, *limit_price, prev, cur)?;
                // When the stop and the limit both clear on the same tick,
                // take the tighter of the two prices.
                let price = match trigger {
                    Some(trigger_price) => {
                        if action.is_buy() {
                            trigger_price.min(*limit_price)
                        } else {
                            trigger_price.max(*limit_price)
                        }
                    }
                    None => limit,
                };
                Some(FillInfo::new(price, quantity))
            }
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?} {:?} QUANT:{}",
            self.instrument,
            self.order_type,
            self.action,
            self.state(),
            self.quantity
        )
    }
}
