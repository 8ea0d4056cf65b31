//! Domain types: quote bars, orders, executions, fill candidates.

pub mod bar;
pub mod fill;
pub mod order;

pub use bar::{Bar, Bars, DataError, Ohlc, QuoteSide};
pub use fill::FillInfo;
pub use order::{
    Action, Execution, Order, OrderError, OrderId, OrderState, OrderType, Rounding,
};
