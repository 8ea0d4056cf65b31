//! QuoteLab Core — discrete-event backtesting over two-sided quote bars.
//!
//! The engine replays historical bars, matches submitted orders against each
//! (previous, current) bar pair, and tracks the resulting cash and position
//! state. The pieces:
//!
//! - Event bus with reentrancy-safe subscription changes
//! - Priority-ordered dispatch loop over simulation subjects
//! - Quote bars with separate ask/bid OHLC sides
//! - Market / limit / stop / stop-limit orders with derived lifecycle state
//! - Backtest broker: matching, commissions, cash-floor enforcement
//! - Position management with entry/exit pairing and P&L tracking
//! - Reference in-memory feed and synthetic quote generation
//!
//! The engine is single-threaded and cooperative: one `Session` per
//! simulation run, no shared state between runs.

pub mod broker;
pub mod dispatch;
pub mod domain;
pub mod event;
pub mod feed;
pub mod strategy;
