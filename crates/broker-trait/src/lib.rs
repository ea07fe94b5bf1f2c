use std::time::Duration;

use analysis_core::Direction;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod paper;

pub use paper::PaperExecutor;

// ---------------------------------------------------------------------------
// Execution types (backing-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `direction`
    pub fn opening(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::None => None,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    /// Reference price; simulated backings fill here
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl OrderRequest {
    pub fn new(symbol: impl Into<String>, side: OrderSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            qty,
            price,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn with_brackets(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub direction: Direction,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub unrealized_pl: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl BrokerPosition {
    pub fn market_value(&self) -> Decimal {
        self.qty * self.current_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub equity: Decimal,
    /// Equity not committed to open positions
    pub available: Decimal,
    pub unrealized_pl: Decimal,
    pub realized_pl: Decimal,
}

/// Result of [`Executor::place_order`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub order: Order,
    pub trade: Option<Fill>,
    pub position: Option<BrokerPosition>,
    pub latency: Duration,
    pub message: Option<String>,
}

/// Asynchronous notifications from the backing, drained by the caller on its
/// own schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    OrderFilled(Fill),
    PositionClosed {
        symbol: String,
        direction: Direction,
        qty: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        pnl: Decimal,
        reason: String,
        closed_at: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Executor: Send + Sync {
    /// Submit an order. A refused order is `Ok` with `success == false`.
    async fn place_order(&self, order: OrderRequest) -> Result<ExecutionReport>;

    /// Cancel an open order by ID
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// All open positions
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn get_equity(&self) -> Result<AccountBalance>;

    async fn update_stop_loss(&self, symbol: &str, stop_loss: Decimal) -> Result<()>;

    async fn update_take_profit(&self, symbol: &str, take_profit: Decimal) -> Result<()>;

    /// Close an entire position. `None` if nothing was open.
    async fn close_position(&self, symbol: &str, reason: &str) -> Result<Option<ExecutionReport>>;

    /// Reconcile local view with the backing
    async fn sync(&self) -> Result<()>;

    /// Feed the latest trade price. Backings that manage stops locally use it
    /// to trigger bracket exits.
    async fn mark_price(&self, _symbol: &str, _price: Decimal) -> Result<()> {
        Ok(())
    }

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Executor name for logging
    fn name(&self) -> &str;
}
