pub mod engine;
pub mod indicators;

pub use engine::{IndicatorSettings, TechnicalIndicatorEngine};
