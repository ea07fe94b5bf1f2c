mod breakout;
mod mean_reversion;
mod statistical;
mod trend;
mod volatility;

pub use breakout::{BreakoutConfig, BreakoutStrategy};
pub use mean_reversion::{MeanReversionConfig, MeanReversionStrategy};
pub use statistical::{StatisticalConfig, StatisticalStrategy};
pub use trend::{TrendConfig, TrendFollowingStrategy};
pub use volatility::{VolatilityConfig, VolatilityStrategy};
