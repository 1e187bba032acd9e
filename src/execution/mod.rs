// Position lifecycle and conditional order matching
pub mod order_manager;
pub mod position_manager;

pub use order_manager::{ConditionalOrder, OrderKind, OrderManager, StopValidation, Trigger};
pub use position_manager::{ClosedTrade, OpenRequest, PnlBasis, Position, PositionManager};
