//! Node-side order plane: limit verification, the single-use serial set and
//! receipt settlement.

pub mod serials;
pub mod settlement;
pub mod verification;

pub use serials::SerialStore;
pub use settlement::{SettlementAgent, SettlementItem, SettlementSink, SettlementSummary, UnsentOrders};
pub use verification::{verify_order, verify_order_limit};
