// store.rs - SQLite persistence implementation
//
// Provides Store for coins, orders, profiles and task-execution audit rows:
// - WAL mode for concurrent reads
// - NORMAL synchronous mode for performance
// - Schema initialization from schema.sql
//
// The connection sits behind a Mutex so one Store can be shared across the
// per-profile scheduler tasks.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Records
// ============================================================================

/// One tracked token
#[derive(Debug, Clone)]
pub struct CoinRecord {
    pub id: i64,
    pub address: String,
    pub name: Option<String>,
    pub market_cap: Option<f64>,
    pub current_price: Option<f64>,
    pub bracket: Option<u8>,
    pub created_at_ms: i64,
    pub last_updated_ms: i64,
}

/// Partial coin update; `None` fields keep their stored value
#[derive(Debug, Clone, Default)]
pub struct CoinUpdate {
    pub name: Option<String>,
    pub market_cap: Option<f64>,
    pub current_price: Option<f64>,
    pub bracket: Option<u8>,
}

/// Terminal-or-active lifecycle state of a persisted order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Active,
    Completed,
    Stopped,
}

impl OrderState {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::Active => "ACTIVE",
            OrderState::Completed => "COMPLETED",
            OrderState::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(OrderState::Active),
            "COMPLETED" => Some(OrderState::Completed),
            "STOPPED" => Some(OrderState::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderState::Active)
    }
}

/// One bracket sub-order row
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: i64,
    pub coin_id: i64,
    pub profile_name: String,
    /// Slot within the bracket (1-4)
    pub bracket_id: u8,
    /// Market cap at creation time
    pub market_cap: f64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub amount: Option<f64>,
    pub status: OrderState,
    pub is_market_order: Option<bool>,
    /// Last trigger-condition text observed from a scrape
    pub trigger_condition: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// Parameters for inserting a fresh order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub coin_id: i64,
    pub profile_name: String,
    pub bracket_id: u8,
    pub market_cap: f64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub amount: Option<f64>,
    pub is_market_order: Option<bool>,
}

/// One isolated trading identity
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub is_logged_in: bool,
    pub last_login_ms: Option<i64>,
    pub is_active: bool,
}

/// One reconciliation-cycle audit row (append-only, observability only)
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub profile_name: String,
    pub scheduled_ms: i64,
    pub start_ms: Option<i64>,
    pub completion_ms: Option<i64>,
    pub success: bool,
    pub missed: bool,
    pub timed_out: bool,
    pub error_message: Option<String>,
    pub rows_processed: i64,
    pub duration_seconds: Option<f64>,
}

/// Parameters for appending a task-execution audit row
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub profile_name: String,
    pub scheduled_ms: i64,
    pub start_ms: Option<i64>,
    pub completion_ms: Option<i64>,
    pub success: bool,
    pub missed: bool,
    pub timed_out: bool,
    pub error_message: Option<String>,
    pub rows_processed: i64,
}

/// Aggregated task health for one profile
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStats {
    pub profile_name: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub missed: i64,
    pub timed_out: i64,
    pub success_rate: f64,
    pub average_duration_seconds: f64,
    pub last_success_ms: Option<i64>,
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed store for all persisted entities
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`, initializing the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        Self::init(conn)
    }

    /// In-memory store for tests and previews.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL mode: concurrent reads during writes
        // NORMAL synchronous: balance between safety and performance
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .context("Failed to configure database settings")?;

        conn.execute_batch(include_str!("schema.sql"))
            .context("Failed to initialize schema")?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-write; recovering
        // the guard is safe because every write is a single statement.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Coins
    // ------------------------------------------------------------------

    /// Create a coin or merge fresher fields into an existing one.
    /// `None` fields in the update never overwrite stored values.
    pub fn upsert_coin(&self, address: &str, update: &CoinUpdate) -> Result<CoinRecord> {
        let now = now_ms();
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO coins (address, name, market_cap, current_price, bracket,
                                    created_at_ms, last_updated_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(address) DO UPDATE SET
                     name = COALESCE(excluded.name, coins.name),
                     market_cap = COALESCE(excluded.market_cap, coins.market_cap),
                     current_price = COALESCE(excluded.current_price, coins.current_price),
                     bracket = COALESCE(excluded.bracket, coins.bracket),
                     last_updated_ms = excluded.last_updated_ms",
                params![
                    address,
                    update.name,
                    update.market_cap,
                    update.current_price,
                    update.bracket.map(|b| b as i64),
                    now,
                ],
            )
            .context("Failed to upsert coin")?;
        }
        self.coin_by_address(address)?
            .context("Coin missing immediately after upsert")
    }

    pub fn coin_by_address(&self, address: &str) -> Result<Option<CoinRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, address, name, market_cap, current_price, bracket,
                    created_at_ms, last_updated_ms
             FROM coins WHERE address = ?1",
            params![address],
            Self::coin_from_row,
        )
        .optional()
        .context("Failed to query coin by address")
    }

    /// Exact (case-sensitive) name lookup.
    pub fn coin_by_name(&self, name: &str) -> Result<Option<CoinRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, address, name, market_cap, current_price, bracket,
                    created_at_ms, last_updated_ms
             FROM coins WHERE name = ?1",
            params![name],
            Self::coin_from_row,
        )
        .optional()
        .context("Failed to query coin by name")
    }

    pub fn all_coins(&self) -> Result<Vec<CoinRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, address, name, market_cap, current_price, bracket,
                        created_at_ms, last_updated_ms
                 FROM coins ORDER BY id",
            )
            .context("Failed to prepare all_coins query")?;
        let coins = stmt
            .query_map([], Self::coin_from_row)
            .context("Failed to execute all_coins query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect coins")?;
        Ok(coins)
    }

    pub fn set_coin_bracket(&self, coin_id: i64, bracket: u8) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE coins SET bracket = ?1, last_updated_ms = ?2 WHERE id = ?3",
            params![bracket as i64, now_ms(), coin_id],
        )
        .context("Failed to update coin bracket")?;
        Ok(())
    }

    fn coin_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoinRecord> {
        Ok(CoinRecord {
            id: row.get(0)?,
            address: row.get(1)?,
            name: row.get(2)?,
            market_cap: row.get(3)?,
            current_price: row.get(4)?,
            bracket: row.get::<_, Option<i64>>(5)?.map(|b| b as u8),
            created_at_ms: row.get(6)?,
            last_updated_ms: row.get(7)?,
        })
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    const ORDER_SELECT: &'static str =
        "SELECT id, coin_id, profile_name, bracket_id, market_cap,
                entry_price, take_profit, stop_loss, amount, status, is_market_order,
                trigger_condition, created_at_ms, updated_at_ms, completed_at_ms
         FROM orders";

    /// Insert a fresh ACTIVE order. Rejected when an ACTIVE order already
    /// occupies the same (coin, profile, slot).
    pub fn insert_order(&self, new: &NewOrder) -> Result<OrderRecord> {
        let now = now_ms();
        let id = {
            let conn = self.lock();
            let res = conn.execute(
                "INSERT INTO orders (coin_id, profile_name, bracket_id, market_cap,
                                     entry_price, take_profit, stop_loss, amount, status,
                                     is_market_order, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'ACTIVE', ?9, ?10, ?10)",
                params![
                    new.coin_id,
                    new.profile_name,
                    new.bracket_id as i64,
                    new.market_cap,
                    new.entry_price,
                    new.take_profit,
                    new.stop_loss,
                    new.amount,
                    new.is_market_order,
                    now,
                ],
            );
            match res {
                Ok(_) => conn.last_insert_rowid(),
                Err(rusqlite::Error::SqliteFailure(e, msg))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    bail!(
                        "an ACTIVE order already occupies slot {} for coin {} / profile {}: {}",
                        new.bracket_id,
                        new.coin_id,
                        new.profile_name,
                        msg.unwrap_or_default()
                    );
                }
                Err(e) => return Err(e).context("Failed to insert order"),
            }
        };
        self.order_by_id(id)?
            .context("Order missing immediately after insert")
    }

    pub fn order_by_id(&self, id: i64) -> Result<Option<OrderRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", Self::ORDER_SELECT),
            params![id],
            Self::order_from_row,
        )
        .optional()
        .context("Failed to query order by id")
    }

    /// ACTIVE orders for one coin and profile, ascending by slot.
    pub fn active_orders_for(&self, coin_id: i64, profile: &str) -> Result<Vec<OrderRecord>> {
        self.query_orders(
            &format!(
                "{} WHERE coin_id = ?1 AND profile_name = ?2 AND status = 'ACTIVE'
                 ORDER BY bracket_id",
                Self::ORDER_SELECT
            ),
            params![coin_id, profile],
        )
    }

    /// The ACTIVE order occupying one slot, if any.
    pub fn active_order_for_slot(
        &self,
        coin_id: i64,
        profile: &str,
        slot: u8,
    ) -> Result<Option<OrderRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "{} WHERE coin_id = ?1 AND profile_name = ?2 AND bracket_id = ?3
                 AND status = 'ACTIVE'",
                Self::ORDER_SELECT
            ),
            params![coin_id, profile, slot as i64],
            Self::order_from_row,
        )
        .optional()
        .context("Failed to query active order for slot")
    }

    pub fn active_orders_by_profile(&self, profile: &str) -> Result<Vec<OrderRecord>> {
        self.query_orders(
            &format!(
                "{} WHERE profile_name = ?1 AND status = 'ACTIVE' ORDER BY coin_id, bracket_id",
                Self::ORDER_SELECT
            ),
            params![profile],
        )
    }

    pub fn orders_by_coin(&self, coin_id: i64) -> Result<Vec<OrderRecord>> {
        self.query_orders(
            &format!(
                "{} WHERE coin_id = ?1 ORDER BY bracket_id, id",
                Self::ORDER_SELECT
            ),
            params![coin_id],
        )
    }

    /// Transition an ACTIVE order to a terminal state. Returns false when the
    /// order was not ACTIVE (terminal orders are immutable).
    pub fn mark_order_terminal(&self, order_id: i64, state: OrderState) -> Result<bool> {
        if !state.is_terminal() {
            bail!("mark_order_terminal called with non-terminal state ACTIVE");
        }
        let now = now_ms();
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE orders SET status = ?1, completed_at_ms = ?2, updated_at_ms = ?2
                 WHERE id = ?3 AND status = 'ACTIVE'",
                params![state.as_str(), now, order_id],
            )
            .context("Failed to mark order terminal")?;
        Ok(updated > 0)
    }

    /// Refresh the last-observed trigger condition for an order.
    pub fn update_trigger_condition(&self, order_id: i64, trigger: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE orders SET trigger_condition = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![trigger, now_ms(), order_id],
        )
        .context("Failed to update trigger condition")?;
        Ok(())
    }

    fn query_orders(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<OrderRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql).context("Failed to prepare order query")?;
        let orders = stmt
            .query_map(params, Self::order_from_row)
            .context("Failed to execute order query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect orders")?;
        Ok(orders)
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
        let status: String = row.get(9)?;
        Ok(OrderRecord {
            id: row.get(0)?,
            coin_id: row.get(1)?,
            profile_name: row.get(2)?,
            bracket_id: row.get::<_, i64>(3)? as u8,
            market_cap: row.get(4)?,
            entry_price: row.get(5)?,
            take_profit: row.get(6)?,
            stop_loss: row.get(7)?,
            amount: row.get(8)?,
            status: OrderState::parse(&status).unwrap_or(OrderState::Active),
            is_market_order: row.get(10)?,
            trigger_condition: row.get(11)?,
            created_at_ms: row.get(12)?,
            updated_at_ms: row.get(13)?,
            completed_at_ms: row.get(14)?,
        })
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub fn upsert_profile(&self, name: &str, api_key: &str) -> Result<ProfileRecord> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO profiles (name, api_key) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET api_key = excluded.api_key",
                params![name, api_key],
            )
            .context("Failed to upsert profile")?;
        }
        self.profile_by_name(name)?
            .context("Profile missing immediately after upsert")
    }

    pub fn profile_by_name(&self, name: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, api_key, is_logged_in, last_login_ms, is_active
             FROM profiles WHERE name = ?1",
            params![name],
            Self::profile_from_row,
        )
        .optional()
        .context("Failed to query profile by name")
    }

    pub fn mark_profile_login(&self, name: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE profiles SET is_logged_in = 1, last_login_ms = ?1 WHERE name = ?2",
            params![now_ms(), name],
        )
        .context("Failed to mark profile login")?;
        Ok(())
    }

    fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRecord> {
        Ok(ProfileRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            api_key: row.get(2)?,
            is_logged_in: row.get(3)?,
            last_login_ms: row.get(4)?,
            is_active: row.get(5)?,
        })
    }

    // ------------------------------------------------------------------
    // Task executions (audit)
    // ------------------------------------------------------------------

    /// Append one task-execution audit row.
    pub fn record_task(&self, task: &NewTask) -> Result<i64> {
        let duration = match (task.start_ms, task.completion_ms) {
            (Some(s), Some(c)) => Some((c - s) as f64 / 1000.0),
            _ => None,
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_executions (profile_name, scheduled_ms, start_ms, completion_ms,
                                          success, missed, timed_out, error_message,
                                          rows_processed, duration_seconds, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.profile_name,
                task.scheduled_ms,
                task.start_ms,
                task.completion_ms,
                task.success,
                task.missed,
                task.timed_out,
                task.error_message,
                task.rows_processed,
                duration,
                now_ms(),
            ],
        )
        .context("Failed to record task execution")?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent task executions for a profile, most recent first.
    pub fn task_history(&self, profile: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, profile_name, scheduled_ms, start_ms, completion_ms, success,
                        missed, timed_out, error_message, rows_processed, duration_seconds
                 FROM task_executions WHERE profile_name = ?1
                 ORDER BY scheduled_ms DESC LIMIT ?2",
            )
            .context("Failed to prepare task_history query")?;
        let tasks = stmt
            .query_map(params![profile, limit as i64], Self::task_from_row)
            .context("Failed to execute task_history query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect task history")?;
        Ok(tasks)
    }

    /// Aggregate task stats for a profile since `since_ms`.
    pub fn task_stats(&self, profile: &str, since_ms: i64) -> Result<TaskStats> {
        let tasks = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, profile_name, scheduled_ms, start_ms, completion_ms, success,
                            missed, timed_out, error_message, rows_processed, duration_seconds
                     FROM task_executions WHERE profile_name = ?1 AND scheduled_ms >= ?2",
                )
                .context("Failed to prepare task_stats query")?;
            stmt.query_map(params![profile, since_ms], Self::task_from_row)
                .context("Failed to execute task_stats query")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to collect task stats")?
        };

        let total = tasks.len() as i64;
        let successful = tasks.iter().filter(|t| t.success && !t.missed).count() as i64;
        let failed = tasks.iter().filter(|t| !t.success && !t.missed).count() as i64;
        let missed = tasks.iter().filter(|t| t.missed).count() as i64;
        let timed_out = tasks.iter().filter(|t| t.timed_out).count() as i64;
        let durations: Vec<f64> = tasks
            .iter()
            .filter(|t| t.success)
            .filter_map(|t| t.duration_seconds)
            .collect();
        let average_duration_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };
        let last_success_ms = tasks
            .iter()
            .filter(|t| t.success && !t.missed)
            .filter_map(|t| t.completion_ms)
            .max();

        Ok(TaskStats {
            profile_name: profile.to_string(),
            total,
            successful,
            failed,
            missed,
            timed_out,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            average_duration_seconds,
            last_success_ms,
        })
    }

    /// Timestamp of the most recent successful cycle for a profile, across
    /// all history. Used by missed-cycle detection after a restart.
    pub fn last_success_ms(&self, profile: &str) -> Result<Option<i64>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT MAX(completion_ms) FROM task_executions
             WHERE profile_name = ?1 AND success = 1 AND missed = 0",
            params![profile],
            |row| row.get::<_, Option<i64>>(0),
        )
        .context("Failed to query last success")
    }

    /// Delete audit rows created before `before_ms`. Returns the count removed.
    pub fn prune_tasks(&self, before_ms: i64) -> Result<usize> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM task_executions WHERE created_at_ms < ?1",
                params![before_ms],
            )
            .context("Failed to prune task executions")?;
        Ok(deleted)
    }

    /// Distinct profile names that have at least one audit row.
    pub fn task_profiles(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT profile_name FROM task_executions ORDER BY profile_name")
            .context("Failed to prepare task_profiles query")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to execute task_profiles query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect profile names")?;
        Ok(names)
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
        Ok(TaskRecord {
            id: row.get(0)?,
            profile_name: row.get(1)?,
            scheduled_ms: row.get(2)?,
            start_ms: row.get(3)?,
            completion_ms: row.get(4)?,
            success: row.get(5)?,
            missed: row.get(6)?,
            timed_out: row.get(7)?,
            error_message: row.get(8)?,
            rows_processed: row.get(9)?,
            duration_seconds: row.get(10)?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn new_order(coin_id: i64, slot: u8) -> NewOrder {
        NewOrder {
            coin_id,
            profile_name: "Saruman".into(),
            bracket_id: slot,
            market_cap: 250_000.0,
            entry_price: 131_000.0,
            take_profit: 247_590.0,
            stop_loss: 78_000.0,
            amount: Some(1.0),
            is_market_order: Some(false),
        }
    }

    #[test]
    fn coin_upsert_merges_without_clobbering() {
        let s = store();
        let coin = s
            .upsert_coin(
                "0xabc",
                &CoinUpdate {
                    name: Some("STIMMY".into()),
                    market_cap: Some(250_000.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(coin.name.as_deref(), Some("STIMMY"));

        // A later update without a name keeps the stored one
        let coin = s
            .upsert_coin(
                "0xabc",
                &CoinUpdate {
                    market_cap: Some(300_000.0),
                    bracket: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(coin.name.as_deref(), Some("STIMMY"));
        assert_eq!(coin.market_cap, Some(300_000.0));
        assert_eq!(coin.bracket, Some(2));
    }

    #[test]
    fn duplicate_active_slot_is_rejected() {
        let s = store();
        let coin = s.upsert_coin("0xabc", &CoinUpdate::default()).unwrap();
        s.insert_order(&new_order(coin.id, 2)).unwrap();
        let err = s.insert_order(&new_order(coin.id, 2)).unwrap_err();
        assert!(err.to_string().contains("already occupies slot 2"));

        // Other slots and other profiles are unaffected
        s.insert_order(&new_order(coin.id, 3)).unwrap();
        let mut other = new_order(coin.id, 2);
        other.profile_name = "Gandalf".into();
        s.insert_order(&other).unwrap();
    }

    #[test]
    fn slot_reopens_after_terminal_transition() {
        let s = store();
        let coin = s.upsert_coin("0xabc", &CoinUpdate::default()).unwrap();
        let order = s.insert_order(&new_order(coin.id, 1)).unwrap();

        assert!(
            s.mark_order_terminal(order.id, OrderState::Completed)
                .unwrap()
        );
        // Terminal orders are immutable; a second transition is a no-op
        assert!(
            !s.mark_order_terminal(order.id, OrderState::Stopped)
                .unwrap()
        );

        let stored = s.order_by_id(order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderState::Completed);
        assert!(stored.completed_at_ms.is_some());

        // The slot is free again
        s.insert_order(&new_order(coin.id, 1)).unwrap();
        assert_eq!(s.active_orders_for(coin.id, "Saruman").unwrap().len(), 1);
    }

    #[test]
    fn profile_upsert_and_login() {
        let s = store();
        let profile = s.upsert_profile("Saruman", "key-1").unwrap();
        assert!(!profile.is_logged_in);
        assert!(profile.is_active);

        // Key rotation keeps the row
        let rotated = s.upsert_profile("Saruman", "key-2").unwrap();
        assert_eq!(rotated.id, profile.id);
        assert_eq!(rotated.api_key, "key-2");

        s.mark_profile_login("Saruman").unwrap();
        let logged_in = s.profile_by_name("Saruman").unwrap().unwrap();
        assert!(logged_in.is_logged_in);
        assert!(logged_in.last_login_ms.is_some());
    }

    #[test]
    fn task_stats_aggregate() {
        let s = store();
        for (success, missed, timed_out, dur) in [
            (true, false, false, Some(12_000)),
            (true, false, false, Some(8_000)),
            (false, false, true, Some(300_000)),
            (false, true, false, None),
        ] {
            s.record_task(&NewTask {
                profile_name: "Saruman".into(),
                scheduled_ms: 1_000,
                start_ms: if missed { None } else { Some(1_000) },
                completion_ms: dur.map(|d| 1_000 + d),
                success,
                missed,
                timed_out,
                rows_processed: 4,
                ..Default::default()
            })
            .unwrap();
        }

        let stats = s.task_stats("Saruman", 0).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.missed, 1);
        assert_eq!(stats.timed_out, 1);
        assert!((stats.success_rate - 50.0).abs() < 1e-9);
        assert!((stats.average_duration_seconds - 10.0).abs() < 1e-9);
        assert_eq!(stats.last_success_ms, Some(13_000));
        assert_eq!(s.last_success_ms("Saruman").unwrap(), Some(13_000));
    }

    #[test]
    fn prune_removes_old_audit_rows() {
        let s = store();
        s.record_task(&NewTask {
            profile_name: "Saruman".into(),
            scheduled_ms: 1_000,
            ..Default::default()
        })
        .unwrap();
        let removed = s.prune_tasks(now_ms() + 1).unwrap();
        assert_eq!(removed, 1);
        assert!(s.task_history("Saruman", 10).unwrap().is_empty());
    }
}
