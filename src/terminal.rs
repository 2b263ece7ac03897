/// Trading-terminal abstraction
///
/// The reconciliation and replacement paths talk to the terminal UI through
/// the `UiTerminal` trait so they never depend on a concrete driver. The
/// shipped implementation is `DryRunTerminal`, a scriptable in-memory
/// terminal used by `--dry-run` runs and the test suite; a live driver
/// implements the same trait.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

/// Failures at the terminal boundary
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("session error: {0}")]
    Session(String),
}

pub type TerminalResult<T> = std::result::Result<T, TerminalError>;

/// Order placement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// Execute immediately at the current price
    Market,
    /// Rest until the target price is reached
    Limit,
}

/// One raw scraped row: its text block plus the row's detail link, if any
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextRow {
    pub text: String,
    pub link: Option<String>,
}

/// Rows scraped under one order-table filter tab
#[derive(Debug, Clone, Default)]
pub struct RowGroup {
    pub filter_index: usize,
    pub rows: Vec<TextRow>,
}

/// Operations the lifecycle engine needs from a terminal session.
///
/// Row indices passed to `delete_entry` refer to positions within the scrape
/// returned by the most recent `scrape_rows` call; callers must re-apply the
/// filter via `click_filter` before each deletion because the table re-renders.
#[async_trait]
pub trait UiTerminal: Send + Sync {
    /// Navigate to a token by contract address. Returns false when the token
    /// page cannot be reached.
    async fn search(&self, address: &str) -> TerminalResult<bool>;

    /// Current market capitalization of the token page in view.
    async fn current_capitalization(&self) -> TerminalResult<f64>;

    /// Scrape the order table, grouped by filter tab.
    async fn scrape_rows(&self) -> TerminalResult<Vec<RowGroup>>;

    /// Re-apply an order-table filter tab.
    async fn click_filter(&self, filter_index: usize) -> TerminalResult<()>;

    /// Delete one row from the order table.
    async fn delete_entry(&self, filter_index: usize, row_index: usize) -> TerminalResult<()>;

    /// Fill in the order form. `price` is required for limit orders.
    async fn place_order(
        &self,
        kind: OrderKind,
        price: Option<f64>,
        amount: f64,
    ) -> TerminalResult<()>;

    /// Attach an auto-sell strategy (TP/SL legs) to the pending order form.
    async fn select_autosell_strategy(
        &self,
        label: &str,
        take_profit: f64,
        stop_loss: f64,
    ) -> TerminalResult<()>;

    /// Submit the pending order form.
    async fn confirm(&self) -> TerminalResult<()>;

    /// Release the session. Called exactly once per cycle, success or failure.
    async fn close_session(&self) -> TerminalResult<()>;
}

// ============================================================================
// Dry-run terminal
// ============================================================================

/// One order the dry-run terminal recorded instead of placing
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPlacement {
    pub address: String,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub amount: f64,
    pub strategy_label: String,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub confirmed: bool,
}

#[derive(Debug, Default)]
struct DryRunState {
    capitalization: f64,
    groups: Vec<RowGroup>,
    current_address: String,
    known_addresses: Vec<String>,
    fail_deletions: bool,
    deletions: Vec<(usize, usize)>,
    filter_clicks: Vec<usize>,
    pending: Option<RecordedPlacement>,
    placements: Vec<RecordedPlacement>,
    session_closed: bool,
}

/// Scriptable in-memory terminal. Records every placement and deletion so
/// tests and dry runs can assert on what would have been done.
#[derive(Debug, Default)]
pub struct DryRunTerminal {
    state: Mutex<DryRunState>,
}

impl DryRunTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script the market capitalization reported for any token page.
    pub fn set_capitalization(&self, cap: f64) {
        self.lock().capitalization = cap;
    }

    /// Script the row groups returned by `scrape_rows`.
    pub fn set_rows(&self, groups: Vec<RowGroup>) {
        self.lock().groups = groups;
    }

    /// Register an address `search` will find.
    pub fn add_known_address(&self, address: &str) {
        self.lock().known_addresses.push(address.to_string());
    }

    /// Make every subsequent `delete_entry` fail.
    pub fn fail_deletions(&self, fail: bool) {
        self.lock().fail_deletions = fail;
    }

    pub fn deletions(&self) -> Vec<(usize, usize)> {
        self.lock().deletions.clone()
    }

    pub fn filter_clicks(&self) -> Vec<usize> {
        self.lock().filter_clicks.clone()
    }

    pub fn placements(&self) -> Vec<RecordedPlacement> {
        self.lock().placements.clone()
    }

    pub fn session_closed(&self) -> bool {
        self.lock().session_closed
    }
}

#[async_trait]
impl UiTerminal for DryRunTerminal {
    async fn search(&self, address: &str) -> TerminalResult<bool> {
        let mut state = self.lock();
        let found = state.known_addresses.iter().any(|a| a == address);
        if found {
            state.current_address = address.to_string();
        }
        Ok(found)
    }

    async fn current_capitalization(&self) -> TerminalResult<f64> {
        Ok(self.lock().capitalization)
    }

    async fn scrape_rows(&self) -> TerminalResult<Vec<RowGroup>> {
        Ok(self.lock().groups.clone())
    }

    async fn click_filter(&self, filter_index: usize) -> TerminalResult<()> {
        self.lock().filter_clicks.push(filter_index);
        Ok(())
    }

    async fn delete_entry(&self, filter_index: usize, row_index: usize) -> TerminalResult<()> {
        let mut state = self.lock();
        if state.fail_deletions {
            return Err(TerminalError::ElementNotFound(format!(
                "delete control for row {row_index} under filter {filter_index}"
            )));
        }
        state.deletions.push((filter_index, row_index));
        Ok(())
    }

    async fn place_order(
        &self,
        kind: OrderKind,
        price: Option<f64>,
        amount: f64,
    ) -> TerminalResult<()> {
        if kind == OrderKind::Limit && price.is_none() {
            return Err(TerminalError::Session(
                "limit order requires a price".to_string(),
            ));
        }
        let mut state = self.lock();
        let address = state.current_address.clone();
        state.pending = Some(RecordedPlacement {
            address,
            kind,
            price,
            amount,
            strategy_label: String::new(),
            take_profit: 0.0,
            stop_loss: 0.0,
            confirmed: false,
        });
        Ok(())
    }

    async fn select_autosell_strategy(
        &self,
        label: &str,
        take_profit: f64,
        stop_loss: f64,
    ) -> TerminalResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| TerminalError::Session("no pending order form".to_string()))?;
        pending.strategy_label = label.to_string();
        pending.take_profit = take_profit;
        pending.stop_loss = stop_loss;
        Ok(())
    }

    async fn confirm(&self) -> TerminalResult<()> {
        let mut state = self.lock();
        let mut pending = state
            .pending
            .take()
            .ok_or_else(|| TerminalError::Session("no pending order form".to_string()))?;
        pending.confirmed = true;
        state.placements.push(pending);
        Ok(())
    }

    async fn close_session(&self) -> TerminalResult<()> {
        self.lock().session_closed = true;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_records_full_placement_flow() {
        let term = DryRunTerminal::new();
        term.add_known_address("0xabc");
        term.set_capitalization(250_000.0);

        assert!(term.search("0xabc").await.unwrap());
        assert!(!term.search("0xmissing").await.unwrap());
        assert_eq!(term.current_capitalization().await.unwrap(), 250_000.0);

        term.place_order(OrderKind::Limit, Some(131_000.0), 5.0)
            .await
            .unwrap();
        term.select_autosell_strategy("Bracket2_2", 247_590.0, 78_000.0)
            .await
            .unwrap();
        term.confirm().await.unwrap();

        let placements = term.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].address, "0xabc");
        assert_eq!(placements[0].price, Some(131_000.0));
        assert_eq!(placements[0].strategy_label, "Bracket2_2");
        assert!(placements[0].confirmed);
    }

    #[tokio::test]
    async fn limit_order_without_price_is_rejected() {
        let term = DryRunTerminal::new();
        assert!(
            term.place_order(OrderKind::Limit, None, 5.0)
                .await
                .is_err()
        );
        // Market orders need no price
        term.place_order(OrderKind::Market, None, 5.0).await.unwrap();
    }

    #[tokio::test]
    async fn injected_deletion_failure() {
        let term = DryRunTerminal::new();
        term.delete_entry(0, 1).await.unwrap();
        term.fail_deletions(true);
        assert!(term.delete_entry(0, 2).await.is_err());
        assert_eq!(term.deletions(), vec![(0, 1)]);
    }
}
