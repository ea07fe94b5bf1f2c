use analysis_core::{Bar, OpenPosition, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::TradingState;

/// Filled trade as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub symbol: String,
    pub direction: String,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Durable sink for bars, trades, positions and state snapshots. Callers treat
/// every method as best-effort.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn record_bar(&self, symbol: &str, timeframe: Timeframe, bar: &Bar) -> Result<()>;

    async fn record_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn record_position(&self, position: &OpenPosition) -> Result<()>;

    async fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        pnl: f64,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn record_snapshot(&self, state: &TradingState) -> Result<()>;

    async fn save_state(&self, key: &str, value: &str) -> Result<()>;

    async fn load_state(&self, key: &str) -> Result<Option<String>>;
}

/// sqlx `Any` backed store (SQLite or Postgres URL)
pub struct SqlPersistence {
    pub(crate) db_pool: sqlx::AnyPool,
}

impl SqlPersistence {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let db_pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(if database_url.contains(":memory:") { 1 } else { 5 })
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {}", database_url))?;
        Ok(Self::new(db_pool))
    }

    /// Create tables if missing.
    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_bars (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time TEXT NOT NULL,
                close_time TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, timeframe, open_time)
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_trades (
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                strategy TEXT,
                executed_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_positions (
                symbol TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                strategy TEXT,
                opened_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                exit_price REAL,
                pnl REAL,
                exit_reason TEXT,
                closed_at TEXT
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                lifecycle TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    pub async fn bar_count(&self, symbol: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM engine_bars WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.db_pool)
            .await?;
        Ok(count)
    }

    pub async fn trades(&self, symbol: &str) -> Result<Vec<TradeRecord>> {
        let rows: Vec<(String, String, String, f64, f64, Option<f64>, Option<f64>, Option<String>, String)> =
            sqlx::query_as(
                "SELECT order_id, symbol, direction, quantity, price, stop_loss, take_profit, strategy, executed_at
                 FROM engine_trades WHERE symbol = ? ORDER BY executed_at",
            )
            .bind(symbol)
            .fetch_all(&self.db_pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let executed_at = DateTime::parse_from_rfc3339(&r.8)
                    .with_context(|| format!("bad timestamp '{}' on trade {}", r.8, r.0))?
                    .with_timezone(&Utc);
                Ok(TradeRecord {
                    order_id: r.0,
                    symbol: r.1,
                    direction: r.2,
                    quantity: r.3,
                    price: r.4,
                    stop_loss: r.5,
                    take_profit: r.6,
                    strategy: r.7,
                    executed_at,
                })
            })
            .collect()
    }

    /// `(status, pnl)` of the stored position for `symbol`
    pub async fn position_status(&self, symbol: &str) -> Result<Option<(String, Option<f64>)>> {
        let row: Option<(String, Option<f64>)> =
            sqlx::query_as("SELECT status, pnl FROM engine_positions WHERE symbol = ?")
                .bind(symbol)
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(row)
    }

    pub async fn latest_snapshot(&self, symbol: &str) -> Result<Option<TradingState>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT state_json FROM engine_snapshots WHERE symbol = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.db_pool)
        .await?;
        match row {
            Some((json,)) => Ok(Some(
                serde_json::from_str(&json).context("decoding stored snapshot")?,
            )),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Persistence for SqlPersistence {
    async fn record_bar(&self, symbol: &str, timeframe: Timeframe, bar: &Bar) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_bars (symbol, timeframe, open_time, close_time, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
                close_time = excluded.close_time, open = excluded.open, high = excluded.high,
                low = excluded.low, close = excluded.close, volume = excluded.volume",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(bar.open_time.to_rfc3339())
        .bind(bar.close_time.to_rfc3339())
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_trades
             (order_id, symbol, direction, quantity, price, stop_loss, take_profit, strategy, executed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.order_id)
        .bind(&trade.symbol)
        .bind(&trade.direction)
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.strategy.as_deref())
        .bind(trade.executed_at.to_rfc3339())
        .execute(&self.db_pool)
        .await
        .with_context(|| format!("storing trade {}", trade.order_id))?;
        Ok(())
    }

    async fn record_position(&self, position: &OpenPosition) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_positions
             (symbol, direction, entry_price, quantity, stop_loss, take_profit, strategy, opened_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open')
             ON CONFLICT(symbol) DO UPDATE SET
                direction = excluded.direction, entry_price = excluded.entry_price,
                quantity = excluded.quantity, stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit, strategy = excluded.strategy,
                opened_at = excluded.opened_at, status = 'open',
                exit_price = NULL, pnl = NULL, exit_reason = NULL, closed_at = NULL",
        )
        .bind(&position.symbol)
        .bind(position.direction.to_string())
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.strategy.map(|s| s.name().to_string()))
        .bind(position.opened_at.to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        pnl: f64,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE engine_positions
             SET status = 'closed', exit_price = ?, pnl = ?, exit_reason = ?, closed_at = ?
             WHERE symbol = ? AND status = 'open'",
        )
        .bind(exit_price)
        .bind(pnl)
        .bind(reason)
        .bind(closed_at.to_rfc3339())
        .bind(symbol)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn record_snapshot(&self, state: &TradingState) -> Result<()> {
        let json = serde_json::to_string(state).context("encoding snapshot")?;
        sqlx::query(
            "INSERT INTO engine_snapshots (symbol, lifecycle, state_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&state.symbol)
        .bind(state.lifecycle.to_string())
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }
}
