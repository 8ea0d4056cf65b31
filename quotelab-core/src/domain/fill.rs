//! Trigger-price determination for limit and stop orders.
//!
//! Ask is the buy-side quote and bid the sell-side, so every rule here is
//! asymmetric by action: buys read the ask columns, sells the bid columns.

use super::bar::Bar;
use super::order::Action;

/// A candidate fill produced by an order's trigger algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillInfo {
    price: f64,
    quantity: f64,
}

impl FillInfo {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }
}

/// Trigger price for a limit order, or None while the limit has not been
/// penetrated. A buy fills only when the previous ask close was strictly
/// above the limit and the current ask low reaches it; sells mirror on the
/// bid side.
pub(crate) fn limit_price_trigger(
    action: Action,
    price: f64,
    prev: &Bar,
    cur: &Bar,
) -> Option<f64> {
    if action.is_buy() {
        (prev.ask().close > price && price >= cur.ask().low).then_some(price)
    } else {
        (prev.bid().close < price && price <= cur.bid().high).then_some(price)
    }
}

/// Trigger price for a stop order, or None while the stop has not been
/// penetrated.
pub(crate) fn stop_price_trigger(
    action: Action,
    price: f64,
    prev: &Bar,
    cur: &Bar,
) -> Option<f64> {
    if action.is_buy() {
        if prev.ask().close < price {
            if cur.ask().low > price {
                // Gapped above the stop: the open is the first available price.
                return Some(cur.ask().open);
            }
            if price <= cur.ask().high {
                // The bar straddles the stop: open or stop, whichever is
                // better for the buyer.
                return Some(cur.ask().open.min(price));
            }
        }
        None
    } else {
        if prev.bid().close > price {
            if cur.bid().high < price {
                return Some(cur.bid().open);
            }
            if price >= cur.bid().low {
                return Some(cur.bid().open.max(price));
            }
        }
        None
    }
}
