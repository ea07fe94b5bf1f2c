pub mod gate;
pub mod models;
pub mod schedule;
pub mod sizing;

pub use gate::RiskGate;
pub use models::*;
pub use schedule::TradingSchedule;
pub use sizing::{PositionSizer, SizingMethod};
