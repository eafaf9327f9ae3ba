//! Data models for signals, positions and orders.

mod order;
mod position;
mod side;
mod signal;

pub use order::{
    infer_role, new_client_order_id, BotRole, NewOrder, Order, OrderStatus, OrderType,
    CLIENT_ID_ENTRY, CLIENT_ID_STOP_LOSS, CLIENT_ID_TAKE_PROFIT,
};
pub use position::{FillEffect, NewPosition, Position, PositionStatus, TrailingLevel, QTY_EPSILON};
pub use side::Side;
pub use signal::{NewSignal, Signal, SignalStatus};
