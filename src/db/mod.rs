//! Database persistence for signals, positions and orders.
//!
//! Stores everything needed to resume after restart:
//! - Signals and their lifecycle status
//! - Live positions and orders
//! - Write-once history copies of retired positions and orders
//!
//! Two invariants live in the schema as partial unique indexes: one OPEN
//! position per (account, symbol) and one active STOP_LOSS per
//! (position, trailing level).

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::models::{
    NewOrder, NewPosition, NewSignal, Order, OrderStatus, Position, Signal, SignalStatus,
    TrailingLevel,
};

/// Longest reason text stored on a signal.
pub const MAX_REASON_CHARS: usize = 500;

const POSITION_COLUMNS: &str = "id, account_id, symbol, side, quantity, entry_price, \
    average_price, current_price, leverage, trailing_level, status, realized_pnl, signal_id, \
    opened_at, updated_at, closed_at";

const ORDER_COLUMNS: &str = "id, account_id, external_id, client_order_id, symbol, side, \
    order_type, price, stop_price, quantity, executed_qty, avg_price, status, bot_role, \
    reduce_only, close_position, position_id, trailing_level, signal_id, created_at, updated_at";

const ACTIVE_ORDER: &str = "status IN ('NEW', 'PARTIALLY_FILLED')";

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Row counts per table for the status command.
#[derive(Debug, Clone, Default)]
pub struct TableCounts {
    pub pending_signals: i64,
    pub open_positions: i64,
    pub active_orders: i64,
    pub archived_positions: i64,
    pub archived_orders: i64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Signals
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit1 REAL NOT NULL,
                take_profit2 REAL,
                take_profit3 REAL,
                quantity REAL,
                leverage INTEGER NOT NULL DEFAULT 1,
                timeframe TEXT,
                expires_at TEXT,
                max_lifetime_secs INTEGER,
                status TEXT NOT NULL DEFAULT 'PENDING',
                position_id INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                triggered_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_signals_pending ON signals(account_id, symbol, status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        // Live positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                average_price REAL NOT NULL,
                current_price REAL NOT NULL DEFAULT 0,
                leverage INTEGER NOT NULL DEFAULT 1,
                trailing_level TEXT NOT NULL DEFAULT 'ORIGINAL',
                status TEXT NOT NULL DEFAULT 'OPEN',
                realized_pnl REAL NOT NULL DEFAULT 0,
                signal_id INTEGER,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_positions_one_open ON positions(account_id, symbol) WHERE status = 'OPEN'",
        )
        .execute(&self.pool)
        .await?;

        // Live orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                client_order_id TEXT NOT NULL DEFAULT '',
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                stop_price REAL NOT NULL DEFAULT 0,
                quantity REAL NOT NULL DEFAULT 0,
                executed_qty REAL NOT NULL DEFAULT 0,
                avg_price REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                bot_role TEXT NOT NULL,
                reduce_only INTEGER NOT NULL DEFAULT 0,
                close_position INTEGER NOT NULL DEFAULT 0,
                position_id INTEGER,
                trailing_level TEXT,
                signal_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_external ON orders(account_id, symbol, external_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_one_active_stop
            ON orders(position_id, trailing_level)
            WHERE bot_role = 'STOP_LOSS' AND status IN ('NEW', 'PARTIALLY_FILLED')
            "#,
        )
        .execute(&self.pool)
        .await?;

        // History
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions_history (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                average_price REAL NOT NULL,
                current_price REAL NOT NULL,
                leverage INTEGER NOT NULL,
                trailing_level TEXT NOT NULL,
                status TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                signal_id INTEGER,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT,
                archived_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders_history (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price REAL NOT NULL,
                stop_price REAL NOT NULL,
                quantity REAL NOT NULL,
                executed_qty REAL NOT NULL,
                avg_price REAL NOT NULL,
                status TEXT NOT NULL,
                bot_role TEXT NOT NULL,
                reduce_only INTEGER NOT NULL,
                close_position INTEGER NOT NULL,
                position_id INTEGER,
                trailing_level TEXT,
                signal_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Signals ====================

    /// Insert a PENDING signal.
    pub async fn insert_signal(&self, signal: &NewSignal, created_at: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (
                account_id, symbol, side, entry_price, stop_loss, take_profit1, take_profit2,
                take_profit3, quantity, leverage, timeframe, expires_at, max_lifetime_secs,
                status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)
            "#,
        )
        .bind(signal.account_id)
        .bind(&signal.symbol)
        .bind(signal.side)
        .bind(signal.entry_price)
        .bind(signal.stop_loss)
        .bind(signal.take_profit1)
        .bind(signal.take_profit2)
        .bind(signal.take_profit3)
        .bind(signal.quantity)
        .bind(signal.leverage)
        .bind(&signal.timeframe)
        .bind(signal.expires_at)
        .bind(signal.max_lifetime_secs)
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_signal(&self, id: i64) -> Result<Option<Signal>> {
        let signal = sqlx::query_as::<_, Signal>("SELECT * FROM signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(signal)
    }

    /// PENDING signals for one symbol, oldest first.
    pub async fn pending_signals(&self, account_id: i64, symbol: &str) -> Result<Vec<Signal>> {
        let signals = sqlx::query_as::<_, Signal>(
            "SELECT * FROM signals WHERE account_id = ? AND symbol = ? AND status = 'PENDING' ORDER BY created_at, id",
        )
        .bind(account_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        Ok(signals)
    }

    /// Every PENDING signal of the account, oldest first.
    pub async fn all_pending_signals(&self, account_id: i64) -> Result<Vec<Signal>> {
        let signals = sqlx::query_as::<_, Signal>(
            "SELECT * FROM signals WHERE account_id = ? AND status = 'PENDING' ORDER BY created_at, id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(signals)
    }

    pub async fn recent_signals(&self, account_id: i64, limit: i64) -> Result<Vec<Signal>> {
        let signals = sqlx::query_as::<_, Signal>(
            "SELECT * FROM signals WHERE account_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(signals)
    }

    /// Compare-and-set PENDING to PROCESSING. False if another evaluation won.
    pub async fn claim_signal(&self, id: i64) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE signals SET status = 'PROCESSING', triggered_at = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a signal that is still PENDING. False if it already moved on.
    pub async fn cancel_pending_signal(&self, id: i64, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE signals SET status = 'CANCELED', error_message = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(truncate_reason(reason))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Set the final status of a PROCESSING signal.
    pub async fn finish_signal(
        &self,
        id: i64,
        status: SignalStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE signals SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(message.map(truncate_reason))
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Compare-and-set PROCESSING to a final status. False if the signal
    /// already left PROCESSING.
    pub async fn settle_processing_signal(
        &self,
        id: i64,
        status: SignalStatus,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE signals SET status = ?, error_message = ?, updated_at = ? WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(status)
        .bind(truncate_reason(message))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// PROCESSING signals claimed before `cutoff`.
    pub async fn stale_processing_signals(
        &self,
        account_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Signal>> {
        let signals = sqlx::query_as::<_, Signal>(
            "SELECT * FROM signals WHERE account_id = ? AND status = 'PROCESSING' AND COALESCE(triggered_at, updated_at) < ? ORDER BY id",
        )
        .bind(account_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(signals)
    }

    /// True when an entry order was recorded for the signal, live or archived.
    pub async fn signal_has_entry(&self, signal_id: i64) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM orders WHERE signal_id = ? AND bot_role = 'ENTRY')
                 + (SELECT COUNT(*) FROM orders_history WHERE signal_id = ? AND bot_role = 'ENTRY')
            "#,
        )
        .bind(signal_id)
        .bind(signal_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn link_signal_position(&self, signal_id: i64, position_id: i64) -> Result<()> {
        sqlx::query("UPDATE signals SET position_id = ?, updated_at = ? WHERE id = ?")
            .bind(position_id)
            .bind(Utc::now())
            .bind(signal_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Symbols with at least one PENDING signal.
    pub async fn pending_symbols(&self, account_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT symbol FROM signals WHERE account_id = ? AND status = 'PENDING'",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    // ==================== Positions ====================

    /// Open a position. `None` when an OPEN position already exists for
    /// the symbol.
    pub async fn open_position(&self, position: &NewPosition) -> Result<Option<i64>> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                account_id, symbol, side, quantity, entry_price, average_price, current_price,
                leverage, trailing_level, status, signal_id, opened_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'ORIGINAL', 'OPEN', ?, ?, ?)
            "#,
        )
        .bind(position.account_id)
        .bind(&position.symbol)
        .bind(position.side)
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.entry_price)
        .bind(position.entry_price)
        .bind(position.leverage)
        .bind(position.signal_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let position = sqlx::query_as::<_, Position>(&format!(
            "SELECT {} FROM positions WHERE id = ?",
            POSITION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position)
    }

    pub async fn find_open_position(&self, account_id: i64, symbol: &str) -> Result<Option<Position>> {
        let position = sqlx::query_as::<_, Position>(&format!(
            "SELECT {} FROM positions WHERE account_id = ? AND symbol = ? AND status = 'OPEN'",
            POSITION_COLUMNS
        ))
        .bind(account_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position)
    }

    pub async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>> {
        let positions = sqlx::query_as::<_, Position>(&format!(
            "SELECT {} FROM positions WHERE account_id = ? AND status = 'OPEN' ORDER BY id",
            POSITION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(positions)
    }

    /// Live positions already CLOSED but not yet archived.
    pub async fn closed_live_positions(&self, account_id: i64) -> Result<Vec<Position>> {
        let positions = sqlx::query_as::<_, Position>(&format!(
            "SELECT {} FROM positions WHERE account_id = ? AND status = 'CLOSED' ORDER BY id",
            POSITION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(positions)
    }

    /// Persist size, average, PnL and status after a fill.
    pub async fn save_position_state(&self, position: &Position) -> Result<()> {
        let now = Utc::now();
        let closed_at = (position.status == crate::models::PositionStatus::Closed).then_some(now);

        sqlx::query(
            r#"
            UPDATE positions SET
                quantity = ?,
                average_price = ?,
                realized_pnl = ?,
                status = ?,
                closed_at = COALESCE(closed_at, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(position.quantity)
        .bind(position.average_price)
        .bind(position.realized_pnl)
        .bind(position.status)
        .bind(closed_at)
        .bind(now)
        .bind(position.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the origin signal of a position that has none yet.
    pub async fn attach_position_signal(&self, position_id: i64, signal_id: i64) -> Result<()> {
        sqlx::query("UPDATE positions SET signal_id = COALESCE(signal_id, ?), updated_at = ? WHERE id = ?")
            .bind(signal_id)
            .bind(Utc::now())
            .bind(position_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_position_price(&self, account_id: i64, symbol: &str, price: f64) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET current_price = ?, updated_at = ? WHERE account_id = ? AND symbol = ? AND status = 'OPEN'",
        )
        .bind(price)
        .bind(Utc::now())
        .bind(account_id)
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Compare-and-set the trailing level. False if the level already moved.
    pub async fn advance_trailing_level(
        &self,
        position_id: i64,
        from: TrailingLevel,
        to: TrailingLevel,
    ) -> Result<bool> {
        if to <= from {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE positions SET trailing_level = ?, updated_at = ? WHERE id = ? AND trailing_level = ? AND status = 'OPEN'",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(position_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Orders ====================

    /// Insert an order row. `None` when it collides with an existing row
    /// (same exchange id, or a second active stop-loss for the level).
    pub async fn insert_order(&self, order: &NewOrder) -> Result<Option<i64>> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                account_id, external_id, client_order_id, symbol, side, order_type, price,
                stop_price, quantity, executed_qty, avg_price, status, bot_role, reduce_only,
                close_position, position_id, trailing_level, signal_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.account_id)
        .bind(&order.external_id)
        .bind(&order.client_order_id)
        .bind(&order.symbol)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.price)
        .bind(order.stop_price)
        .bind(order.quantity)
        .bind(order.executed_qty)
        .bind(order.avg_price)
        .bind(order.status)
        .bind(order.bot_role)
        .bind(order.reduce_only)
        .bind(order.close_position)
        .bind(order.position_id)
        .bind(order.trailing_level)
        .bind(order.signal_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_order(&self, account_id: i64, symbol: &str, external_id: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE account_id = ? AND symbol = ? AND external_id = ?",
            ORDER_COLUMNS
        ))
        .bind(account_id)
        .bind(symbol)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn get_order(&self, id: i64) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// Apply an exchange status to an active order. Terminal rows are never
    /// touched, so late or replayed updates cannot regress them.
    pub async fn apply_order_state(
        &self,
        id: i64,
        status: OrderStatus,
        executed_qty: f64,
        avg_price: f64,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE orders SET
                status = ?,
                executed_qty = MAX(executed_qty, ?),
                avg_price = CASE WHEN ? > 0 THEN ? ELSE avg_price END,
                updated_at = ?
            WHERE id = ? AND {}
            "#,
            ACTIVE_ORDER
        ))
        .bind(status)
        .bind(executed_qty)
        .bind(avg_price)
        .bind(avg_price)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_order_canceled(&self, id: i64) -> Result<bool> {
        self.apply_order_state(id, OrderStatus::Canceled, 0.0, 0.0).await
    }

    pub async fn set_order_position(&self, order_id: i64, position_id: i64) -> Result<()> {
        sqlx::query("UPDATE orders SET position_id = ?, updated_at = ? WHERE id = ?")
            .bind(position_id)
            .bind(Utc::now())
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Fill in links that a row recorded from the stream is missing. False
    /// when the row is gone or the link would duplicate an active stop.
    pub async fn adopt_order(
        &self,
        order_id: i64,
        position_id: Option<i64>,
        trailing_level: Option<TrailingLevel>,
        signal_id: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                position_id = COALESCE(position_id, ?),
                trailing_level = COALESCE(trailing_level, ?),
                signal_id = COALESCE(signal_id, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(position_id)
        .bind(trailing_level)
        .bind(signal_id)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach unlinked active protective orders for the symbol to a new
    /// position. Only the newest stop-loss is linked; returns rows linked.
    pub async fn link_protective_orders(&self, account_id: i64, symbol: &str, position_id: i64) -> Result<u64> {
        let now = Utc::now();

        let stops = sqlx::query(&format!(
            r#"
            UPDATE orders SET position_id = ?, trailing_level = COALESCE(trailing_level, 'ORIGINAL'), updated_at = ?
            WHERE id = (
                SELECT id FROM orders
                WHERE account_id = ? AND symbol = ? AND position_id IS NULL
                  AND bot_role = 'STOP_LOSS' AND {}
                ORDER BY id DESC LIMIT 1
            )
            "#,
            ACTIVE_ORDER
        ))
        .bind(position_id)
        .bind(now)
        .bind(account_id)
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        let targets = sqlx::query(&format!(
            r#"
            UPDATE orders SET position_id = ?, updated_at = ?
            WHERE account_id = ? AND symbol = ? AND position_id IS NULL
              AND bot_role = 'TAKE_PROFIT' AND {}
            "#,
            ACTIVE_ORDER
        ))
        .bind(position_id)
        .bind(now)
        .bind(account_id)
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        Ok(stops.rows_affected() + targets.rows_affected())
    }

    pub async fn active_orders(&self, account_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE account_id = ? AND {} ORDER BY id",
            ORDER_COLUMNS, ACTIVE_ORDER
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    pub async fn active_orders_for_symbol(&self, account_id: i64, symbol: &str) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE account_id = ? AND symbol = ? AND {} ORDER BY id",
            ORDER_COLUMNS, ACTIVE_ORDER
        ))
        .bind(account_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Active stop-loss protecting a position at the given level.
    pub async fn active_stop_for_level(&self, position_id: i64, level: TrailingLevel) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE position_id = ? AND trailing_level = ? AND bot_role = 'STOP_LOSS' AND {}",
            ORDER_COLUMNS, ACTIVE_ORDER
        ))
        .bind(position_id)
        .bind(level)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn orders_for_position(&self, position_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE position_id = ? ORDER BY id",
            ORDER_COLUMNS
        ))
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Live rows already in a terminal status, waiting for migration.
    pub async fn terminal_orders(&self, account_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE account_id = ? AND NOT ({}) ORDER BY id",
            ORDER_COLUMNS, ACTIVE_ORDER
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Symbols with a live position or active order.
    pub async fn symbols_in_use(&self, account_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT symbol FROM positions WHERE account_id = ? AND status = 'OPEN'
            UNION
            SELECT symbol FROM orders WHERE account_id = ? AND {}
            "#,
            ACTIVE_ORDER
        ))
        .bind(account_id)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    // ==================== Archival ====================

    /// Move one terminal order to history.
    pub async fn archive_order(&self, order_id: i64) -> Result<bool> {
        let archived = retry_on_contention("archive_order", || self.archive_order_once(order_id))
            .await
            .with_context(|| format!("Failed to archive order {}", order_id))?;

        Ok(archived)
    }

    async fn archive_order_once(&self, order_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let copied = sqlx::query(&format!(
            "INSERT OR IGNORE INTO orders_history ({cols}, archived_at) SELECT {cols}, ? FROM orders WHERE id = ?",
            cols = ORDER_COLUMNS
        ))
        .bind(Utc::now())
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM orders WHERE id = ?")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(order_id, copied = copied.rows_affected(), "Order archived");

        Ok(deleted.rows_affected() == 1)
    }

    /// The one move-to-history operation for positions: copies the position
    /// (as CLOSED) and all its orders to history and deletes the live rows,
    /// in one transaction. Returns false if the position was already gone.
    pub async fn archive_position(&self, position_id: i64) -> Result<bool> {
        let archived = retry_on_contention("archive_position", || self.archive_position_once(position_id))
            .await
            .with_context(|| format!("Failed to archive position {}", position_id))?;

        Ok(archived)
    }

    async fn archive_position_once(&self, position_id: i64) -> Result<bool, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let copied = sqlx::query(
            r#"
            INSERT OR IGNORE INTO positions_history (
                id, account_id, symbol, side, quantity, entry_price, average_price, current_price,
                leverage, trailing_level, status, realized_pnl, signal_id, opened_at, updated_at,
                closed_at, archived_at
            )
            SELECT id, account_id, symbol, side, quantity, entry_price, average_price, current_price,
                leverage, trailing_level, 'CLOSED', realized_pnl, signal_id, opened_at, ?,
                COALESCE(closed_at, ?), ?
            FROM positions WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT OR IGNORE INTO orders_history ({cols}, archived_at) SELECT {cols}, ? FROM orders WHERE position_id = ?",
            cols = ORDER_COLUMNS
        ))
        .bind(now)
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM orders WHERE position_id = ?")
            .bind(position_id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM positions WHERE id = ?")
            .bind(position_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(position_id, copied = copied.rows_affected(), "Position archived");

        Ok(deleted.rows_affected() == 1)
    }

    pub async fn archived_position(&self, position_id: i64) -> Result<Option<Position>> {
        let position = sqlx::query_as::<_, Position>(&format!(
            "SELECT {} FROM positions_history WHERE id = ?",
            POSITION_COLUMNS
        ))
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position)
    }

    pub async fn archived_orders_for_position(&self, position_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders_history WHERE position_id = ? ORDER BY id",
            ORDER_COLUMNS
        ))
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// True when the order already retired to history.
    pub async fn is_order_archived(&self, account_id: i64, symbol: &str, external_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders_history WHERE account_id = ? AND symbol = ? AND external_id = ?",
        )
        .bind(account_id)
        .bind(symbol)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn count_archived_positions(&self, position_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM positions_history WHERE id = ?")
            .bind(position_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // ==================== Status ====================

    pub async fn table_counts(&self, account_id: i64) -> Result<TableCounts> {
        let count = |sql: String| {
            let pool = self.pool.clone();
            async move {
                let (n,): (i64,) = sqlx::query_as(&sql).bind(account_id).fetch_one(&pool).await?;
                Ok::<i64, sqlx::Error>(n)
            }
        };

        Ok(TableCounts {
            pending_signals: count(
                "SELECT COUNT(*) FROM signals WHERE account_id = ? AND status = 'PENDING'".to_string(),
            )
            .await?,
            open_positions: count(
                "SELECT COUNT(*) FROM positions WHERE account_id = ? AND status = 'OPEN'".to_string(),
            )
            .await?,
            active_orders: count(format!(
                "SELECT COUNT(*) FROM orders WHERE account_id = ? AND {}",
                ACTIVE_ORDER
            ))
            .await?,
            archived_positions: count(
                "SELECT COUNT(*) FROM positions_history WHERE account_id = ?".to_string(),
            )
            .await?,
            archived_orders: count("SELECT COUNT(*) FROM orders_history WHERE account_id = ?".to_string())
                .await?,
        })
    }
}

#[cfg(test)]
impl Database {
    /// Run raw SQL; tests use it to break the schema under a running engine.
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Truncate a reason to [`MAX_REASON_CHARS`] characters.
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_REASON_CHARS).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Lock-wait, deadlock and busy errors that are worth retrying.
pub fn is_contention(e: &sqlx::Error) -> bool {
    let message = match e {
        sqlx::Error::Database(db) => db.message().to_lowercase(),
        sqlx::Error::PoolTimedOut => return true,
        _ => return false,
    };

    ["database is locked", "busy", "deadlock", "lock wait timeout"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Run a storage operation, retrying contention errors with bounded
/// exponential backoff. Other errors fail immediately.
async fn retry_on_contention<T, F, Fut>(operation: &str, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if is_contention(&e) {
                    warn!(operation, error = %e, "Storage contention, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
