//! Position lifecycle: one entry order paired with at most one exit order.
//!
//! States move WaitingEntry -> Open -> Closed; no transition skips a state.
//! Every order event routed here first updates the signed share count (with
//! the order's rounding) and the tracker, then runs the state machine, so
//! transition logic always sees a share count that already reflects the
//! fill being processed.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::broker::{OrderEvent, OrderEventKind};
use crate::domain::order::{OrderId, Rounding};

use super::tracker::PositionTracker;

/// Identifier handed out by the session's position registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    WaitingEntry,
    Open,
    Closed,
}

/// Which side the position trades from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("exit order is active and should be canceled first")]
    ExitOrderActive,

    #[error("unknown position {0}")]
    Unknown(PositionId),

    #[error("unexpected event for order {0} in state {1:?}")]
    UnexpectedOrderEvent(OrderId, PositionState),
}

/// Strategy notification produced by a position state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEffect {
    EnterOk,
    EnterCanceled,
    ExitOk,
    ExitCanceled,
}

/// One trade: an entry order and, once requested, an exit order, with the
/// bookkeeping between them. Orders are referenced by id; the broker owns
/// them and events deliver snapshots.
pub struct Position {
    id: PositionId,
    direction: Direction,
    instrument: String,
    state: PositionState,
    entry_order: OrderId,
    exit_order: Option<OrderId>,
    shares: f64,
    rounding: Rounding,
    tracker: PositionTracker,
    good_till_canceled: bool,
    all_or_none: bool,
    entry_datetime: Option<DateTime<Utc>>,
    exit_datetime: Option<DateTime<Utc>>,
    entry_active: bool,
    exit_active: bool,
    entry_filled: bool,
    exit_filled: bool,
}

impl Position {
    pub(crate) fn new(
        id: PositionId,
        direction: Direction,
        instrument: impl Into<String>,
        entry_order: OrderId,
        rounding: Rounding,
        good_till_canceled: bool,
        all_or_none: bool,
    ) -> Self {
        Self {
            id,
            direction,
            instrument: instrument.into(),
            state: PositionState::WaitingEntry,
            entry_order,
            exit_order: None,
            shares: 0.0,
            rounding,
            tracker: PositionTracker::new(rounding),
            good_till_canceled,
            all_or_none,
            entry_datetime: None,
            exit_datetime: None,
            entry_active: true,
            exit_active: false,
            entry_filled: false,
            exit_filled: false,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn id(&self) -> PositionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    /// True until the position reaches Closed.
    pub fn is_open(&self) -> bool {
        self.state != PositionState::Closed
    }

    /// Signed share count: positive long, negative short, zero before the
    /// entry fills and after the exit completes.
    pub fn shares(&self) -> f64 {
        self.shares
    }

    pub fn entry_order(&self) -> OrderId {
        self.entry_order
    }

    pub fn exit_order(&self) -> Option<OrderId> {
        self.exit_order
    }

    pub fn entry_active(&self) -> bool {
        self.entry_active
    }

    pub fn entry_filled(&self) -> bool {
        self.entry_filled
    }

    pub fn exit_active(&self) -> bool {
        self.exit_active
    }

    pub fn exit_filled(&self) -> bool {
        self.exit_filled
    }

    pub fn good_till_canceled(&self) -> bool {
        self.good_till_canceled
    }

    pub fn all_or_none(&self) -> bool {
        self.all_or_none
    }

    pub fn entry_datetime(&self) -> Option<DateTime<Utc>> {
        self.entry_datetime
    }

    pub fn exit_datetime(&self) -> Option<DateTime<Utc>> {
        self.exit_datetime
    }

    /// Time spent since entry, up to the exit or `now` while still open.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        match self.entry_datetime {
            Some(entered) => self.exit_datetime.unwrap_or(now) - entered,
            None => Duration::zero(),
        }
    }

    /// P&L at `last_price` (unrealized while open, realized once closed).
    pub fn pnl(&self, last_price: Option<f64>, include_commissions: bool) -> f64 {
        self.tracker.pnl(last_price, include_commissions)
    }

    /// Fractional returns on committed capital at `last_price`.
    pub fn returns(&self, last_price: Option<f64>, include_commissions: bool) -> f64 {
        self.tracker.returns(last_price, include_commissions)
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub(crate) fn set_exit_order(&mut self, exit_order: OrderId) {
        self.exit_order = Some(exit_order);
        self.exit_active = true;
        self.exit_filled = false;
    }

    // ── Event handling ─────────────────────────────────────────────────

    /// Routes one order event through the position: bookkeeping first, then
    /// the state machine. Returns the strategy notification to fire, if any.
    pub(crate) fn on_order_event(
        &mut self,
        event: &OrderEvent,
    ) -> Result<Option<PositionEffect>, PositionError> {
        let order = &event.order;
        let order_id = order
            .id()
            .ok_or(PositionError::UnexpectedOrderEvent(self.entry_order, self.state))?;

        // Keep the order-activity flags current from the snapshot.
        if order_id == self.entry_order {
            self.entry_active = order.is_active();
            self.entry_filled = order.is_filled();
        } else if Some(order_id) == self.exit_order {
            self.exit_active = order.is_active();
            self.exit_filled = order.is_filled();
        }

        // Share count and tracker reflect the fill before any transition
        // logic runs.
        if let (Some(execution), OrderEventKind::Filled | OrderEventKind::PartiallyFilled) =
            (&event.execution, &event.kind)
        {
            if order.action().is_buy() {
                self.tracker
                    .buy(execution.quantity, execution.price, execution.commission);
                self.shares = self.rounding.apply(self.shares + execution.quantity);
            } else {
                self.tracker
                    .sell(execution.quantity, execution.price, execution.commission);
                self.shares = self.rounding.apply(self.shares - execution.quantity);
            }
        }

        match self.state {
            PositionState::WaitingEntry => {
                if order_id != self.entry_order {
                    return Err(PositionError::UnexpectedOrderEvent(order_id, self.state));
                }
                match &event.kind {
                    OrderEventKind::Filled | OrderEventKind::PartiallyFilled => {
                        self.state = PositionState::Open;
                        self.entry_datetime =
                            event.execution.as_ref().map(|execution| execution.datetime);
                        Ok(Some(PositionEffect::EnterOk))
                    }
                    OrderEventKind::Canceled { .. } => {
                        debug_assert!(
                            order.filled() == 0.0,
                            "a partial fill should have opened the position"
                        );
                        self.state = PositionState::Closed;
                        Ok(Some(PositionEffect::EnterCanceled))
                    }
                    OrderEventKind::Submitted | OrderEventKind::Accepted => Ok(None),
                }
            }
            PositionState::Open => {
                if Some(order_id) == self.exit_order {
                    match &event.kind {
                        OrderEventKind::Filled => {
                            if self.shares == 0.0 {
                                self.state = PositionState::Closed;
                                self.exit_datetime = event
                                    .execution
                                    .as_ref()
                                    .map(|execution| execution.datetime);
                                Ok(Some(PositionEffect::ExitOk))
                            } else {
                                Ok(None)
                            }
                        }
                        OrderEventKind::Canceled { .. } => {
                            debug_assert!(self.shares != 0.0);
                            Ok(Some(PositionEffect::ExitCanceled))
                        }
                        _ => Ok(None),
                    }
                } else if order_id == self.entry_order {
                    // The entry may finish filling, or get canceled after a
                    // partial fill; the share count above already covers it.
                    Ok(None)
                } else {
                    Err(PositionError::UnexpectedOrderEvent(order_id, self.state))
                }
            }
            PositionState::Closed => {
                Err(PositionError::UnexpectedOrderEvent(order_id, self.state))
            }
        }
    }
}

/// Arena of live positions keyed by id. Positions leave the registry once
/// they reach Closed; events for unregistered positions cannot be routed.
#[derive(Default)]
pub struct PositionRegistry {
    positions: HashMap<PositionId, Position>,
    next_id: u64,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate(&mut self) -> PositionId {
        let id = PositionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn register(&mut self, position: Position) {
        self.positions.insert(position.id(), position);
    }

    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: PositionId) -> Option<&mut Position> {
        self.positions.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: PositionId) -> Option<Position> {
        self.positions.remove(&id)
    }

    pub fn ids(&self) -> Vec<PositionId> {
        let mut ids: Vec<PositionId> = self.positions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
