//! Simulated executor
//!
//! Orders fill immediately at their reference price. Stops and targets are
//! held locally and evaluated on every [`Executor::mark_price`] call; closed
//! positions are reported as [`ExecutionEvent::PositionClosed`] on the event
//! queue handed out by [`PaperExecutor::new`].

use std::collections::HashMap;
use std::time::Instant;

use analysis_core::Direction;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::*;

#[derive(Debug)]
struct PaperBook {
    /// Starting equity plus realized PnL
    balance: Decimal,
    realized_pl: Decimal,
    positions: HashMap<String, BrokerPosition>,
    orders: HashMap<String, Order>,
}

impl PaperBook {
    fn unrealized(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pl).sum()
    }

    fn committed(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.qty * p.avg_entry_price)
            .sum()
    }
}

pub struct PaperExecutor {
    book: RwLock<PaperBook>,
    events: mpsc::Sender<ExecutionEvent>,
}

impl PaperExecutor {
    /// Returns the executor and the receiving end of its event queue.
    pub fn new(starting_equity: Decimal, event_capacity: usize) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(event_capacity.max(1));
        let executor = Self {
            book: RwLock::new(PaperBook {
                balance: starting_equity,
                realized_pl: Decimal::ZERO,
                positions: HashMap::new(),
                orders: HashMap::new(),
            }),
            events: tx,
        };
        (executor, rx)
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Paper executor event dropped: {}", e);
        }
    }

    fn pnl(direction: Direction, entry: Decimal, exit: Decimal, qty: Decimal) -> Decimal {
        match direction {
            Direction::Long => (exit - entry) * qty,
            Direction::Short => (entry - exit) * qty,
            Direction::None => Decimal::ZERO,
        }
    }

    /// Remove a position from the book and settle it. Caller holds the lock.
    fn settle(
        book: &mut PaperBook,
        symbol: &str,
        exit_price: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<(BrokerPosition, ExecutionEvent)> {
        let mut position = book.positions.remove(symbol)?;
        let pnl = Self::pnl(position.direction, position.avg_entry_price, exit_price, position.qty);
        book.balance += pnl;
        book.realized_pl += pnl;
        position.current_price = exit_price;
        position.unrealized_pl = Decimal::ZERO;

        let event = ExecutionEvent::PositionClosed {
            symbol: symbol.to_string(),
            direction: position.direction,
            qty: position.qty,
            entry_price: position.avg_entry_price,
            exit_price,
            pnl,
            reason: reason.to_string(),
            closed_at: now,
        };
        Some((position, event))
    }

    fn rejected(order: &OrderRequest, now: DateTime<Utc>, started: Instant, message: String) -> ExecutionReport {
        ExecutionReport {
            success: false,
            order: Order {
                id: uuid::Uuid::new_v4().to_string(),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.qty,
                filled_qty: Decimal::ZERO,
                filled_avg_price: None,
                status: OrderStatus::Rejected,
                created_at: now,
                filled_at: None,
            },
            trade: None,
            position: None,
            latency: started.elapsed(),
            message: Some(message),
        }
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    async fn place_order(&self, order: OrderRequest) -> Result<ExecutionReport> {
        let started = Instant::now();
        let now = Utc::now();

        if order.qty <= Decimal::ZERO || order.price <= Decimal::ZERO {
            return Ok(Self::rejected(
                &order,
                now,
                started,
                format!("invalid quantity {} or price {}", order.qty, order.price),
            ));
        }

        let mut events = Vec::new();
        let report = {
            let mut book = self.book.write().await;
            let direction = order.side.direction();
            let existing = book.positions.get(&order.symbol).map(|p| p.direction);

            // an opposite order flattens the position
            if existing.is_some_and(|d| d != direction) {
                let Some((closed, event)) = Self::settle(&mut book, &order.symbol, order.price, "closed by order", now) else {
                    return Err(anyhow!("position {} vanished while closing", order.symbol));
                };
                events.push(event);
                let fill = Fill {
                    order_id: uuid::Uuid::new_v4().to_string(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: closed.qty,
                    price: order.price,
                    timestamp: now,
                };
                Self::filled(&mut book, &order, fill, None, started, &mut events)
            } else {
                let notional = order.qty * order.price;
                let available = book.balance + book.unrealized() - book.committed();
                if notional > available {
                    return Ok(Self::rejected(
                        &order,
                        now,
                        started,
                        format!("insufficient buying power: need {}, have {}", notional, available),
                    ));
                }

                let position = match book.positions.get_mut(&order.symbol) {
                    Some(p) => {
                        let total = p.qty + order.qty;
                        p.avg_entry_price = (p.avg_entry_price * p.qty + order.price * order.qty) / total;
                        p.qty = total;
                        p.current_price = order.price;
                        p.unrealized_pl = Self::pnl(p.direction, p.avg_entry_price, order.price, p.qty);
                        if order.stop_loss.is_some() {
                            p.stop_loss = order.stop_loss;
                        }
                        if order.take_profit.is_some() {
                            p.take_profit = order.take_profit;
                        }
                        p.clone()
                    }
                    None => {
                        let p = BrokerPosition {
                            symbol: order.symbol.clone(),
                            direction,
                            qty: order.qty,
                            avg_entry_price: order.price,
                            current_price: order.price,
                            stop_loss: order.stop_loss,
                            take_profit: order.take_profit,
                            unrealized_pl: Decimal::ZERO,
                            opened_at: now,
                        };
                        book.positions.insert(order.symbol.clone(), p.clone());
                        p
                    }
                };
                let fill = Fill {
                    order_id: uuid::Uuid::new_v4().to_string(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: order.qty,
                    price: order.price,
                    timestamp: now,
                };
                Self::filled(&mut book, &order, fill, Some(position), started, &mut events)
            }
        };

        info!(
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.qty,
            price = %order.price,
            "Paper order filled"
        );
        for event in events {
            self.emit(event);
        }
        Ok(report)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let book = self.book.read().await;
        match book.orders.get(order_id) {
            Some(order) if order.status == OrderStatus::New => Ok(()),
            Some(order) => Err(anyhow!("order {} is {:?}, cannot cancel", order_id, order.status)),
            None => Err(anyhow!("order {} not found", order_id)),
        }
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let book = self.book.read().await;
        let mut positions: Vec<BrokerPosition> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_equity(&self) -> Result<AccountBalance> {
        let book = self.book.read().await;
        let unrealized = book.unrealized();
        let equity = book.balance + unrealized;
        Ok(AccountBalance {
            equity,
            available: equity - book.committed(),
            unrealized_pl: unrealized,
            realized_pl: book.realized_pl,
        })
    }

    async fn update_stop_loss(&self, symbol: &str, stop_loss: Decimal) -> Result<()> {
        let mut book = self.book.write().await;
        let position = book
            .positions
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("no open position for {}", symbol))?;
        position.stop_loss = Some(stop_loss);
        debug!(symbol, stop_loss = %stop_loss, "Paper stop updated");
        Ok(())
    }

    async fn update_take_profit(&self, symbol: &str, take_profit: Decimal) -> Result<()> {
        let mut book = self.book.write().await;
        let position = book
            .positions
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("no open position for {}", symbol))?;
        position.take_profit = Some(take_profit);
        debug!(symbol, take_profit = %take_profit, "Paper target updated");
        Ok(())
    }

    async fn close_position(&self, symbol: &str, reason: &str) -> Result<Option<ExecutionReport>> {
        let started = Instant::now();
        let now = Utc::now();
        let mut events = Vec::new();
        let report = {
            let mut book = self.book.write().await;
            let Some(price) = book.positions.get(symbol).map(|p| p.current_price) else {
                return Ok(None);
            };
            let Some((closed, event)) = Self::settle(&mut book, symbol, price, reason, now) else {
                return Ok(None);
            };
            events.push(event);
            let side = match closed.direction {
                Direction::Short => OrderSide::Buy,
                _ => OrderSide::Sell,
            };
            let request = OrderRequest::new(symbol, side, closed.qty, price);
            let fill = Fill {
                order_id: uuid::Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                side,
                qty: closed.qty,
                price,
                timestamp: now,
            };
            Self::filled(&mut book, &request, fill, None, started, &mut events)
        };
        info!(symbol, reason, "Paper position closed");
        for event in events {
            self.emit(event);
        }
        Ok(Some(report))
    }

    async fn sync(&self) -> Result<()> {
        let book = self.book.read().await;
        debug!(
            positions = book.positions.len(),
            balance = %book.balance,
            "Paper book in sync"
        );
        Ok(())
    }

    async fn mark_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut book = self.book.write().await;
            let Some(position) = book.positions.get_mut(symbol) else {
                return Ok(());
            };
            position.current_price = price;
            position.unrealized_pl =
                Self::pnl(position.direction, position.avg_entry_price, price, position.qty);

            let exit = match position.direction {
                Direction::Long => match (position.stop_loss, position.take_profit) {
                    (Some(stop), _) if price <= stop => Some((stop, "stop loss")),
                    (_, Some(target)) if price >= target => Some((target, "take profit")),
                    _ => None,
                },
                Direction::Short => match (position.stop_loss, position.take_profit) {
                    (Some(stop), _) if price >= stop => Some((stop, "stop loss")),
                    (_, Some(target)) if price <= target => Some((target, "take profit")),
                    _ => None,
                },
                Direction::None => None,
            };

            if let Some((level, reason)) = exit {
                if let Some((_, event)) = Self::settle(&mut book, symbol, level, reason, now) {
                    info!(symbol, reason, level = %level, "Paper bracket triggered");
                    events.push(event);
                }
            }
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "paper"
    }
}

impl PaperExecutor {
    fn filled(
        book: &mut PaperBook,
        request: &OrderRequest,
        fill: Fill,
        position: Option<BrokerPosition>,
        started: Instant,
        events: &mut Vec<ExecutionEvent>,
    ) -> ExecutionReport {
        let order = Order {
            id: fill.order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            filled_qty: fill.qty,
            filled_avg_price: Some(fill.price),
            status: OrderStatus::Filled,
            created_at: fill.timestamp,
            filled_at: Some(fill.timestamp),
        };
        book.orders.insert(order.id.clone(), order.clone());
        events.push(ExecutionEvent::OrderFilled(fill.clone()));
        ExecutionReport {
            success: true,
            order,
            trade: Some(fill),
            position,
            latency: started.elapsed(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    async fn drain(rx: &mut mpsc::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_fills_at_reference_price() {
        let (paper, mut rx) = PaperExecutor::new(d(10_000), 16);
        let request = OrderRequest::new("ETHUSDT", OrderSide::Buy, Decimal::new(125, 2), d(2000))
            .with_brackets(Some(d(1960)), Some(d(2120)));
        let report = paper.place_order(request).await.unwrap();

        assert!(report.success);
        assert_eq!(report.order.status, OrderStatus::Filled);
        let position = report.position.unwrap();
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.avg_entry_price, d(2000));
        assert_eq!(position.stop_loss, Some(d(1960)));

        let balance = paper.get_equity().await.unwrap();
        assert_eq!(balance.equity, d(10_000));
        assert_eq!(balance.available, d(7_500));

        let events = drain(&mut rx).await;
        assert!(matches!(events.as_slice(), [ExecutionEvent::OrderFilled(_)]));
    }

    #[tokio::test]
    async fn test_rejects_oversized_order() {
        let (paper, _rx) = PaperExecutor::new(d(1_000), 16);
        let report = paper
            .place_order(OrderRequest::new("ETHUSDT", OrderSide::Buy, d(1), d(2000)))
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.order.status, OrderStatus::Rejected);
        assert!(report.message.unwrap().contains("buying power"));
        assert!(paper.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_profit_closes_with_pnl() {
        let (paper, mut rx) = PaperExecutor::new(d(10_000), 16);
        paper
            .place_order(
                OrderRequest::new("ETHUSDT", OrderSide::Buy, d(1), d(2000))
                    .with_brackets(Some(d(1960)), Some(d(2120))),
            )
            .await
            .unwrap();
        drain(&mut rx).await;

        paper.mark_price("ETHUSDT", d(2050)).await.unwrap();
        assert_eq!(paper.get_equity().await.unwrap().unrealized_pl, d(50));
        assert!(drain(&mut rx).await.is_empty());

        paper.mark_price("ETHUSDT", d(2130)).await.unwrap();
        let events = drain(&mut rx).await;
        match events.as_slice() {
            [ExecutionEvent::PositionClosed { pnl, reason, exit_price, .. }] => {
                assert_eq!(*pnl, d(120));
                assert_eq!(*exit_price, d(2120));
                assert_eq!(reason, "take profit");
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(paper.get_positions().await.unwrap().is_empty());
        assert_eq!(paper.get_equity().await.unwrap().equity, d(10_120));
    }

    #[tokio::test]
    async fn test_short_stop_loss() {
        let (paper, mut rx) = PaperExecutor::new(d(10_000), 16);
        paper
            .place_order(OrderRequest::new("ETHUSDT", OrderSide::Sell, d(2), d(2000)))
            .await
            .unwrap();
        paper.update_stop_loss("ETHUSDT", d(2040)).await.unwrap();
        drain(&mut rx).await;

        paper.mark_price("ETHUSDT", d(2045)).await.unwrap();
        match drain(&mut rx).await.as_slice() {
            [ExecutionEvent::PositionClosed { pnl, reason, .. }] => {
                assert_eq!(*pnl, d(-80));
                assert_eq!(reason, "stop loss");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_position_and_missing_symbol() {
        let (paper, mut rx) = PaperExecutor::new(d(10_000), 16);
        assert!(paper.close_position("ETHUSDT", "manual").await.unwrap().is_none());
        assert!(paper.update_take_profit("ETHUSDT", d(1)).await.is_err());

        paper
            .place_order(OrderRequest::new("ETHUSDT", OrderSide::Buy, d(1), d(2000)))
            .await
            .unwrap();
        paper.mark_price("ETHUSDT", d(1990)).await.unwrap();
        let report = paper.close_position("ETHUSDT", "reversed").await.unwrap().unwrap();
        assert!(report.success);
        assert_eq!(report.order.side, OrderSide::Sell);

        let closed: Vec<_> = drain(&mut rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::PositionClosed { pnl, reason, .. } => Some((pnl, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(closed, vec![(d(-10), "reversed".to_string())]);
    }

    #[tokio::test]
    async fn test_cancel_filled_order_fails() {
        let (paper, _rx) = PaperExecutor::new(d(10_000), 16);
        let report = paper
            .place_order(OrderRequest::new("ETHUSDT", OrderSide::Buy, d(1), d(100)))
            .await
            .unwrap();
        assert!(paper.cancel_order(&report.order.id).await.is_err());
        assert!(paper.cancel_order("missing").await.is_err());
    }
}
