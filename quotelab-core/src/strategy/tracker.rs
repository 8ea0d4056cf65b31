//! Per-instrument P&L accounting that mirrors executed order fills.

use serde::{Deserialize, Serialize};

use crate::domain::order::Rounding;

/// Tracks volume-weighted entry price, realized P&L, cumulative commissions,
/// and the capital committed to one position. Mutated only through `buy` and
/// `sell` calls mirroring actual executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionTracker {
    rounding: Rounding,
    pnl: f64,
    avg_price: f64,
    position: f64,
    commissions: f64,
    total_committed: f64,
}

impl PositionTracker {
    pub fn new(rounding: Rounding) -> Self {
        Self {
            rounding,
            pnl: 0.0,
            avg_price: 0.0,
            position: 0.0,
            commissions: 0.0,
            total_committed: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.rounding);
    }

    /// Signed open amount: positive long, negative short.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Volume-weighted average price of the open amount.
    pub fn avg_price(&self) -> f64 {
        self.avg_price
    }

    pub fn commissions(&self) -> f64 {
        self.commissions
    }

    pub fn total_committed(&self) -> f64 {
        self.total_committed
    }

    /// P&L that would result from closing the open amount at `price`.
    /// Without a price, only realized P&L is reported.
    pub fn pnl(&self, price: Option<f64>, include_commissions: bool) -> f64 {
        let mut ret = self.pnl;
        if let Some(price) = price {
            ret += (price - self.avg_price) * self.position;
        }
        if include_commissions {
            ret -= self.commissions;
        }
        ret
    }

    /// Cumulative fractional return on the capital committed so far.
    pub fn returns(&self, price: Option<f64>, include_commissions: bool) -> f64 {
        let pnl = self.pnl(price, include_commissions);
        if self.total_committed != 0.0 {
            pnl / self.total_committed
        } else {
            0.0
        }
    }

    fn open_new_position(&mut self, quantity: f64, price: f64) {
        self.avg_price = price;
        self.position = quantity;
        self.total_committed = self.avg_price * self.position.abs();
    }

    fn extend_current_position(&mut self, quantity: f64, price: f64) {
        let new_position = self.rounding.apply(self.position + quantity);
        self.avg_price = (self.avg_price * self.position.abs() + price * quantity.abs())
            / new_position.abs();
        self.position = new_position;
        self.total_committed = self.avg_price * self.position.abs();
    }

    fn reduce_current_position(&mut self, quantity: f64, price: f64) {
        debug_assert!(
            self.rounding.apply(self.position.abs() - quantity.abs()) >= 0.0,
            "reduction exceeds the open amount"
        );
        self.pnl += (price - self.avg_price) * quantity * -1.0;
        self.position = self.rounding.apply(self.position + quantity);
        if self.position == 0.0 {
            self.avg_price = 0.0;
        }
    }

    /// Applies one signed trade: positive buys, negative sells.
    pub fn update(&mut self, quantity: f64, price: f64, commission: f64) {
        debug_assert!(quantity != 0.0, "invalid quantity");
        debug_assert!(price > 0.0, "invalid price");
        debug_assert!(commission >= 0.0, "invalid commission");

        if self.position == 0.0 {
            self.open_new_position(quantity, price);
        } else if self.position.signum() == quantity.signum() {
            self.extend_current_position(quantity, price);
        } else if quantity.abs() <= self.position.abs() {
            // Reducing, possibly to flat.
            self.reduce_current_position(quantity, price);
        } else {
            // Crossing through zero: close out, then open the other way.
            let new_position = self.position + quantity;
            let closing = -self.position;
            self.reduce_current_position(closing, price);
            self.open_new_position(new_position, price);
        }
        self.commissions += commission;
    }

    pub fn buy(&mut self, quantity: f64, price: f64, commission: f64) {
        debug_assert!(quantity > 0.0, "invalid quantity");
        self.update(quantity, price, commission);
    }

    pub fn sell(&mut self, quantity: f64, price: f64, commission: f64) {
        debug_assert!(quantity > 0.0, "invalid quantity");
        self.update(-quantity, price, commission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PositionTracker {
        PositionTracker::new(Rounding::WholeShares)
    }

    #[test]
    fn long_round_trip_realizes_pnl_and_return() {
        let mut tracker = tracker();
        tracker.buy(10.0, 50.0, 0.0);
        assert_eq!(tracker.position(), 10.0);
        assert_eq!(tracker.avg_price(), 50.0);
        assert_eq!(tracker.total_committed(), 500.0);

        tracker.sell(10.0, 55.0, 0.0);
        assert_eq!(tracker.position(), 0.0);
        assert_eq!(tracker.pnl(None, true), 50.0);
        assert_eq!(tracker.returns(None, true), 0.1);
    }

    #[test]
    fn short_round_trip() {
        let mut tracker = tracker();
        tracker.sell(5.0, 100.0, 0.0);
        assert_eq!(tracker.position(), -5.0);

        tracker.buy(5.0, 90.0, 0.0);
        assert_eq!(tracker.position(), 0.0);
        assert_eq!(tracker.pnl(None, true), 50.0);
    }

    #[test]
    fn extending_updates_vwap() {
        let mut tracker = tracker();
        tracker.buy(10.0, 100.0, 0.0);
        tracker.buy(10.0, 110.0, 0.0);
        assert_eq!(tracker.position(), 20.0);
        assert_eq!(tracker.avg_price(), 105.0);
        assert_eq!(tracker.total_committed(), 2100.0);
    }

    #[test]
    fn partial_reduce_keeps_avg_price() {
        let mut tracker = tracker();
        tracker.buy(10.0, 100.0, 0.0);
        tracker.sell(4.0, 110.0, 0.0);
        assert_eq!(tracker.position(), 6.0);
        assert_eq!(tracker.avg_price(), 100.0);
        assert_eq!(tracker.pnl(None, true), 40.0);
    }

    #[test]
    fn crossing_zero_reopens_at_trade_price() {
        let mut tracker = tracker();
        tracker.buy(10.0, 100.0, 0.0);
        tracker.sell(15.0, 110.0, 0.0);
        // 10 closed at +10 each, 5 short opened at 110.
        assert_eq!(tracker.position(), -5.0);
        assert_eq!(tracker.avg_price(), 110.0);
        assert_eq!(tracker.pnl(None, true), 100.0);
    }

    #[test]
    fn unrealized_pnl_marks_open_amount() {
        let mut tracker = tracker();
        tracker.buy(10.0, 100.0, 0.0);
        assert_eq!(tracker.pnl(Some(108.0), true), 80.0);
        assert_eq!(tracker.returns(Some(108.0), true), 0.08);
    }

    #[test]
    fn commissions_subtract_from_pnl() {
        let mut tracker = tracker();
        tracker.buy(10.0, 50.0, 1.5);
        tracker.sell(10.0, 55.0, 1.5);
        assert_eq!(tracker.pnl(None, true), 47.0);
        assert_eq!(tracker.pnl(None, false), 50.0);
        assert_eq!(tracker.commissions(), 3.0);
    }
}
