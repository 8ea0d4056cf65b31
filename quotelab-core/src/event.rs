//! Typed publish/subscribe channel with reentrancy-safe subscription changes.
//!
//! Handlers run synchronously in subscription order. While an emit is in
//! progress, subscribe/unsubscribe requests are queued and applied only when
//! the outermost emit finishes, so a handler may add or remove handlers
//! (including itself) without corrupting the iteration. Re-entrant emit from
//! inside a handler is allowed. The bus is single-threaded by design.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Token identifying one subscription; pass it back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Handler<T> = Rc<dyn Fn(&T)>;

enum PendingOp<T> {
    Subscribe(u64, Handler<T>),
    Unsubscribe(u64),
}

struct BusState<T> {
    handlers: RefCell<Vec<(u64, Handler<T>)>>,
    pending: RefCell<Vec<PendingOp<T>>>,
    emitting: Cell<u32>,
    next_id: Cell<u64>,
}

/// Cheaply cloneable handle to a shared event channel. Clones publish to and
/// subscribe on the same underlying handler list.
pub struct EventBus<T> {
    state: Rc<BusState<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(BusState {
                handlers: RefCell::new(Vec::new()),
                pending: RefCell::new(Vec::new()),
                emitting: Cell::new(0),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Registers a handler. Takes effect immediately, or once the current
    /// emit completes if one is in progress.
    pub fn subscribe(&self, handler: impl Fn(&T) + 'static) -> Subscription {
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        let handler: Handler<T> = Rc::new(handler);
        if self.state.emitting.get() > 0 {
            self.state
                .pending
                .borrow_mut()
                .push(PendingOp::Subscribe(id, handler));
        } else {
            self.state.handlers.borrow_mut().push((id, handler));
        }
        Subscription(id)
    }

    /// Removes a handler. Takes effect immediately, or once the current emit
    /// completes if one is in progress. Unknown tokens are ignored.
    pub fn unsubscribe(&self, subscription: Subscription) {
        if self.state.emitting.get() > 0 {
            self.state
                .pending
                .borrow_mut()
                .push(PendingOp::Unsubscribe(subscription.0));
        } else {
            self.state
                .handlers
                .borrow_mut()
                .retain(|(id, _)| *id != subscription.0);
        }
    }

    /// Invokes every currently registered handler, in subscription order.
    pub fn emit(&self, payload: &T) {
        self.state.emitting.set(self.state.emitting.get() + 1);
        // Snapshot so handlers queued mid-emit never join this iteration.
        let snapshot: Vec<Handler<T>> = self
            .state
            .handlers
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(payload);
        }
        let depth = self.state.emitting.get() - 1;
        self.state.emitting.set(depth);
        if depth == 0 {
            self.apply_pending();
        }
    }

    fn apply_pending(&self) {
        let ops: Vec<PendingOp<T>> = self.state.pending.borrow_mut().drain(..).collect();
        let mut handlers = self.state.handlers.borrow_mut();
        for op in ops {
            match op {
                PendingOp::Subscribe(id, handler) => handlers.push((id, handler)),
                PendingOp::Unsubscribe(id) => handlers.retain(|(other, _)| *other != id),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.handlers.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus: EventBus<i32> = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Rc::clone(&seen);
            bus.subscribe(move |value: &i32| seen.borrow_mut().push((tag, *value)));
        }

        bus.emit(&7);
        assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Rc::new(Cell::new(0));

        let sub = {
            let count = Rc::clone(&count);
            bus.subscribe(move |_| count.set(count.get() + 1))
        };

        bus.emit(&1);
        bus.unsubscribe(sub);
        bus.emit(&2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn subscribe_during_emit_is_deferred_to_next_emit() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Rc::new(Cell::new(0));

        {
            let bus_handle = bus.clone();
            let count = Rc::clone(&count);
            bus.subscribe(move |_| {
                let count = Rc::clone(&count);
                bus_handle.subscribe(move |_| count.set(count.get() + 1));
            });
        }

        // The inner handler is queued during this emit and must not run yet.
        bus.emit(&1);
        assert_eq!(count.get(), 0);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn unsubscribe_during_emit_still_runs_this_emit() {
        let bus: EventBus<i32> = EventBus::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let later_sub = Rc::new(RefCell::new(None));
        {
            let bus_handle = bus.clone();
            let later_sub = Rc::clone(&later_sub);
            let calls = Rc::clone(&calls);
            bus.subscribe(move |_| {
                calls.borrow_mut().push("first");
                if let Some(sub) = later_sub.borrow_mut().take() {
                    bus_handle.unsubscribe(sub);
                }
            });
        }
        {
            let calls = Rc::clone(&calls);
            let sub = bus.subscribe(move |_| calls.borrow_mut().push("second"));
            *later_sub.borrow_mut() = Some(sub);
        }

        // First handler unsubscribes the second mid-emit; the removal only
        // applies after the emit, so "second" still fires once.
        bus.emit(&1);
        assert_eq!(*calls.borrow(), vec!["first", "second"]);

        bus.emit(&2);
        assert_eq!(*calls.borrow(), vec!["first", "second", "first"]);
    }

    #[test]
    fn handler_can_unsubscribe_itself() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Rc::new(Cell::new(0));

        let sub_slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let sub = {
            let bus_handle = bus.clone();
            let sub_slot = Rc::clone(&sub_slot);
            let count = Rc::clone(&count);
            bus.subscribe(move |_| {
                count.set(count.get() + 1);
                if let Some(sub) = *sub_slot.borrow() {
                    bus_handle.unsubscribe(sub);
                }
            })
        };
        *sub_slot.borrow_mut() = Some(sub);

        bus.emit(&1);
        bus.emit(&2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn reentrant_emit_applies_pending_only_at_depth_zero() {
        let bus: EventBus<i32> = EventBus::new();
        let added = Rc::new(Cell::new(0));

        {
            let bus_handle = bus.clone();
            let added = Rc::clone(&added);
            bus.subscribe(move |value: &i32| {
                if *value == 0 {
                    let added = Rc::clone(&added);
                    bus_handle.subscribe(move |_| added.set(added.get() + 1));
                    // Nested emit: the handler added above must still be pending.
                    bus_handle.emit(&1);
                }
            });
        }

        bus.emit(&0);
        assert_eq!(added.get(), 0);
        // Both levels have unwound; the pending subscription is live now.
        bus.emit(&2);
        assert_eq!(added.get(), 1);
    }
}
