//! Commission schemes.

use crate::domain::order::Order;

/// Computes the fee for one order execution.
pub trait Commission {
    fn calculate(&self, order: &Order, price: f64, quantity: f64) -> f64;
}

/// Charges nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommission;

impl Commission for NoCommission {
    fn calculate(&self, _order: &Order, _price: f64, _quantity: f64) -> f64 {
        0.0
    }
}

/// Charges a fixed amount for the whole trade, applied to the first fill only.
#[derive(Debug, Clone, Copy)]
pub struct FixedPerTrade {
    amount: f64,
}

impl FixedPerTrade {
    pub fn new(amount: f64) -> Self {
        Self { amount }
    }
}

impl Commission for FixedPerTrade {
    fn calculate(&self, order: &Order, _price: f64, _quantity: f64) -> f64 {
        if order.executions().is_empty() {
            self.amount
        } else {
            0.0
        }
    }
}

/// Charges a percentage of the traded notional. 0.01 means 1%.
#[derive(Debug, Clone, Copy)]
pub struct TradePercentage {
    percentage: f64,
}

impl TradePercentage {
    pub fn new(percentage: f64) -> Self {
        debug_assert!(percentage < 1.0, "percentage is a fraction, not percent");
        Self { percentage }
    }
}

impl Commission for TradePercentage {
    fn calculate(&self, _order: &Order, price: f64, quantity: f64) -> f64 {
        price * quantity * self.percentage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{Action, Execution, OrderId, OrderType, Rounding};
    use chrono::{TimeZone, Utc};

    fn order() -> Order {
        Order::new(
            OrderType::Market {
                fill_on_close: false,
            },
            Action::Buy,
            "eurusd",
            10.0,
            Rounding::WholeShares,
        )
        .unwrap()
    }

    #[test]
    fn no_commission_is_zero() {
        assert_eq!(NoCommission.calculate(&order(), 100.0, 10.0), 0.0);
    }

    #[test]
    fn fixed_per_trade_charges_first_fill_only() {
        let scheme = FixedPerTrade::new(2.5);
        let mut order = order();
        assert_eq!(scheme.calculate(&order, 100.0, 4.0), 2.5);

        order.submitted(OrderId(1), None);
        order
            .execute(Execution {
                price: 100.0,
                quantity: 4.0,
                commission: 2.5,
                datetime: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            })
            .unwrap();
        assert_eq!(scheme.calculate(&order, 100.0, 6.0), 0.0);
    }

    #[test]
    fn trade_percentage_scales_with_notional() {
        let scheme = TradePercentage::new(0.01);
        assert_eq!(scheme.calculate(&order(), 100.0, 10.0), 10.0);
    }
}
