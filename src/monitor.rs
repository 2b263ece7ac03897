/// Reconciliation cycle orchestrator
///
/// One cycle runs in two phases. Phase one scrapes the order table, parses
/// and classifies every row, and for each take-profit hit deletes the spent
/// row from the terminal before retiring the persisted order. Phase two
/// drains the queued replacements, re-arming each consumed slot. The order
/// matters: deletions change row indices, so no placement happens until the
/// scrape has been fully walked.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::brackets::SLOT_COUNT;
use crate::executor;
use crate::identify::{self, IdentifyOutcome};
use crate::persistence::{OrderState, Store};
use crate::replacement::{self, ReplacementJob};
use crate::row::parse_row;
use crate::status;
use crate::terminal::UiTerminal;

/// Bracket slots left without an ACTIVE order after the cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MissingOrders {
    pub coin_address: String,
    pub coin_name: Option<String>,
    pub bracket: u8,
    pub slots: Vec<u8>,
}

/// What one completed cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub rows_checked: usize,
    pub tp_hits: usize,
    pub queued_replacements: usize,
    pub orders_replaced: usize,
    pub missing: Vec<MissingOrders>,
    pub replacement_details: Vec<String>,
    pub summary: String,
}

/// Outcome of one reconciliation cycle
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The order table was empty; nothing to reconcile
    NoOrders,
    Failed { reason: String },
}

impl CycleOutcome {
    pub fn rows_processed(&self) -> usize {
        match self {
            CycleOutcome::Completed(report) => report.rows_checked,
            _ => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, CycleOutcome::Failed { .. })
    }
}

/// Run one reconciliation cycle for `profile`. `fallback_amount` sizes
/// replacement orders whose retired original had no recorded amount.
pub async fn run_cycle(
    terminal: &dyn UiTerminal,
    store: &Store,
    profile: &str,
    fallback_amount: f64,
) -> CycleOutcome {
    match cycle_inner(terminal, store, profile, fallback_amount).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(profile, error = %format!("{e:#}"), "cycle failed");
            CycleOutcome::Failed {
                reason: format!("{e:#}"),
            }
        }
    }
}

async fn cycle_inner(
    terminal: &dyn UiTerminal,
    store: &Store,
    profile: &str,
    fallback_amount: f64,
) -> Result<CycleOutcome> {
    let groups = terminal
        .scrape_rows()
        .await
        .context("failed to scrape the order table")?;
    if groups.iter().all(|g| g.rows.is_empty()) {
        info!(profile, "order table is empty");
        return Ok(CycleOutcome::NoOrders);
    }

    let mut report = CycleReport::default();
    let mut jobs: Vec<ReplacementJob> = Vec::new();
    // Coins touched this cycle, keyed by coin id, for the post-drain diagnosis
    let mut touched: BTreeMap<i64, (String, Option<String>, u8)> = BTreeMap::new();

    // ---- Phase one: detect and mark ----
    for group in &groups {
        for (row_index, text_row) in group.rows.iter().enumerate() {
            let Some(parsed) = parse_row(&text_row.text, text_row.link.as_deref()) else {
                continue;
            };
            report.rows_checked += 1;
            let row_status = status::classify(&parsed);

            let matched = match identify::identify(store, profile, &parsed, row_status)? {
                IdentifyOutcome::Matched(m) => m,
                IdentifyOutcome::NoCoin { token } => {
                    warn!(profile, token, "row matches no known coin");
                    continue;
                }
                IdentifyOutcome::NoBracket { coin } => {
                    warn!(profile, address = %coin.address, "coin has no resolvable bracket");
                    continue;
                }
            };
            touched.insert(
                matched.coin.id,
                (
                    matched.coin.address.clone(),
                    matched.coin.name.clone(),
                    matched.bracket,
                ),
            );

            if !status::is_tp_hit(&parsed.trigger_condition) {
                continue;
            }
            report.tp_hits += 1;
            let Some(order) = matched.order else {
                warn!(
                    profile,
                    address = %matched.coin.address,
                    "take-profit hit matched no persisted order; skipping"
                );
                continue;
            };

            // The table re-renders between rows; re-apply the filter so the
            // row index from the scrape still points at the right row.
            terminal
                .click_filter(group.filter_index)
                .await
                .context("failed to re-apply the order-table filter")?;
            if let Err(e) = terminal.delete_entry(group.filter_index, row_index).await {
                // Database stays untouched so the next cycle retries.
                warn!(
                    profile,
                    address = %matched.coin.address,
                    slot = order.bracket_id,
                    error = %e,
                    "terminal deletion failed; keeping the order ACTIVE"
                );
                continue;
            }

            // The terminal row is already gone at this point. A store failure
            // here leaves an ACTIVE row with no terminal counterpart, which
            // no later cycle can retire on its own; log it loudly and keep
            // the cycle going so other rows are unaffected.
            match store.mark_order_terminal(order.id, OrderState::Completed) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(profile, order_id = order.id, "order was already terminal");
                    continue;
                }
                Err(e) => {
                    error!(
                        profile,
                        address = %matched.coin.address,
                        order_id = order.id,
                        slot = order.bracket_id,
                        error = %format!("{e:#}"),
                        "database update failed after terminal deletion succeeded; \
                         order needs manual reconciliation"
                    );
                    continue;
                }
            }
            info!(
                profile,
                address = %matched.coin.address,
                bracket = matched.bracket,
                slot = order.bracket_id,
                "take-profit hit retired"
            );
            jobs.push(ReplacementJob {
                coin_address: matched.coin.address.clone(),
                bracket: matched.bracket,
                slot: order.bracket_id,
                amount: order.amount.unwrap_or(fallback_amount),
            });
        }
    }
    report.queued_replacements = jobs.len();

    // ---- Phase two: replace ----
    for job in jobs.drain(..) {
        let detail = match replacement::plan(terminal, store, &job).await {
            Ok(plan) => {
                match executor::place_bracket_order(terminal, store, profile, &job.coin_address, &plan)
                    .await
                {
                    Ok(order) => {
                        report.orders_replaced += 1;
                        format!(
                            "{}: slot {} re-armed at entry {} ({:?})",
                            job.coin_address, order.bracket_id, order.entry_price, plan.kind
                        )
                    }
                    Err(e) => format!("{}: slot {} placement failed: {e:#}", job.coin_address, job.slot),
                }
            }
            Err(e) => format!("{}: slot {} planning failed: {e:#}", job.coin_address, job.slot),
        };
        report.replacement_details.push(detail);
    }

    // ---- Post-drain diagnosis: slots with no ACTIVE order ----
    for (coin_id, (address, name, bracket)) in &touched {
        let active = store.active_orders_for(*coin_id, profile)?;
        let missing: Vec<u8> = (1..=SLOT_COUNT as u8)
            .filter(|slot| !active.iter().any(|o| o.bracket_id == *slot))
            .collect();
        if !missing.is_empty() {
            warn!(profile, address = %address, ?missing, "slots without an ACTIVE order");
            report.missing.push(MissingOrders {
                coin_address: address.clone(),
                coin_name: name.clone(),
                bracket: *bracket,
                slots: missing,
            });
        }
    }

    report.summary = format!(
        "checked {} rows, {} TP hits, {} queued, {} replaced, {} coins with missing slots",
        report.rows_checked,
        report.tp_hits,
        report.queued_replacements,
        report.orders_replaced,
        report.missing.len()
    );
    info!(profile, summary = %report.summary, "cycle completed");
    Ok(CycleOutcome::Completed(report))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brackets;
    use crate::persistence::{CoinUpdate, NewOrder};
    use crate::terminal::{DryRunTerminal, RowGroup, TextRow};

    const PROFILE: &str = "Saruman";

    fn seed_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_orders(&store);
        store
    }

    fn seed_orders(store: &Store) {
        let coin = store
            .upsert_coin(
                "0xstimmy",
                &CoinUpdate {
                    name: Some("STIMMY".into()),
                    market_cap: Some(250_000.0),
                    bracket: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        for p in brackets::order_parameters(2, 6.0) {
            store
                .insert_order(&NewOrder {
                    coin_id: coin.id,
                    profile_name: PROFILE.into(),
                    bracket_id: p.slot,
                    market_cap: 250_000.0,
                    entry_price: p.entry_price,
                    take_profit: p.take_profit,
                    stop_loss: p.stop_loss,
                    amount: Some(p.amount),
                    is_market_order: Some(false),
                })
                .unwrap();
        }
    }

    fn tp_hit_row() -> TextRow {
        // Slot 2 of bracket 2: entry target 131K, TP leg already consumed
        TextRow {
            text: "Auto\nSell\nSTIMMY\n$2.00\n+0\n$0\n12h 00m 00s\n1\n0/0\n1 SL\nActive"
                .into(),
            link: Some("https://terminal/order/1".into()),
        }
    }

    fn pending_row(trigger: &str) -> TextRow {
        TextRow {
            text: format!(
                "Auto\nSell\nSTIMMY\n$2.00\n+0\n$0\n12h 00m 00s\n1\n0/0\n{trigger}\nActive"
            ),
            link: None,
        }
    }

    #[tokio::test]
    async fn empty_table_yields_no_orders() {
        let term = DryRunTerminal::new();
        term.set_rows(vec![RowGroup {
            filter_index: 0,
            rows: vec![],
        }]);
        let store = Store::open_in_memory().unwrap();
        let outcome = run_cycle(&term, &store, PROFILE, 1.0).await;
        assert!(matches!(outcome, CycleOutcome::NoOrders));
    }

    #[tokio::test]
    async fn tp_hit_retires_and_replaces_the_slot() {
        let store = seed_store();
        let term = DryRunTerminal::new();
        term.add_known_address("0xstimmy");
        term.set_capitalization(250_000.0);
        term.set_rows(vec![RowGroup {
            filter_index: 0,
            rows: vec![
                pending_row("Buy below $93.1K"),
                tp_hit_row(),
                pending_row("Buy below $231K"),
                pending_row("Buy below $331K"),
            ],
        }]);

        let outcome = run_cycle(&term, &store, PROFILE, 1.0).await;
        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.rows_checked, 4);
        assert_eq!(report.tp_hits, 1);
        assert_eq!(report.queued_replacements, 1);
        assert_eq!(report.orders_replaced, 1);
        assert!(report.missing.is_empty());

        // The TP-hit row carries no entry price; expiry matching over four
        // same-age orders resolves to slot 1. Filter re-applied before the
        // deletion.
        assert_eq!(term.deletions(), vec![(0, 1)]);
        assert_eq!(term.filter_clicks(), vec![0]);

        // The slot was retired then re-armed: still 4 ACTIVE orders
        let coin = store.coin_by_address("0xstimmy").unwrap().unwrap();
        let active = store.active_orders_for(coin.id, PROFILE).unwrap();
        assert_eq!(active.len(), 4);

        // Exactly one COMPLETED order in history
        let all = store.orders_by_coin(coin.id).unwrap();
        let completed: Vec<_> = all
            .iter()
            .filter(|o| o.status == OrderState::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn failed_deletion_keeps_the_order_active() {
        let store = seed_store();
        let term = DryRunTerminal::new();
        term.add_known_address("0xstimmy");
        term.set_capitalization(250_000.0);
        term.fail_deletions(true);
        term.set_rows(vec![RowGroup {
            filter_index: 0,
            rows: vec![tp_hit_row()],
        }]);

        let outcome = run_cycle(&term, &store, PROFILE, 1.0).await;
        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.tp_hits, 1);
        assert_eq!(report.queued_replacements, 0);
        assert_eq!(report.orders_replaced, 0);

        // Nothing retired, nothing placed: the next cycle retries
        let coin = store.coin_by_address("0xstimmy").unwrap().unwrap();
        let active = store.active_orders_for(coin.id, PROFILE).unwrap();
        assert_eq!(active.len(), 4);
        assert!(term.placements().is_empty());
    }

    #[tokio::test]
    async fn store_failure_after_deletion_does_not_abort_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bot.db");
        let store = Store::open(&db).unwrap();
        seed_orders(&store);

        // Make the COMPLETED transition fail at the database level while
        // every other statement keeps working
        let raw = rusqlite::Connection::open(&db).unwrap();
        raw.execute_batch(
            "CREATE TRIGGER block_retire BEFORE UPDATE ON orders
             WHEN NEW.status = 'COMPLETED'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        let term = DryRunTerminal::new();
        term.add_known_address("0xstimmy");
        term.set_capitalization(250_000.0);
        term.set_rows(vec![RowGroup {
            filter_index: 0,
            rows: vec![tp_hit_row(), pending_row("Buy below $231K")],
        }]);

        let outcome = run_cycle(&term, &store, PROFILE, 1.0).await;
        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        // The deletion happened, the retirement did not, and the remaining
        // rows were still processed
        assert_eq!(term.deletions(), vec![(0, 0)]);
        assert_eq!(report.rows_checked, 2);
        assert_eq!(report.tp_hits, 1);
        assert_eq!(report.queued_replacements, 0);
        assert_eq!(report.orders_replaced, 0);

        let coin = store.coin_by_address("0xstimmy").unwrap().unwrap();
        assert_eq!(store.active_orders_for(coin.id, PROFILE).unwrap().len(), 4);
        assert!(term.placements().is_empty());
    }

    #[tokio::test]
    async fn missing_slots_reported_after_drain() {
        let store = seed_store();
        let coin = store.coin_by_address("0xstimmy").unwrap().unwrap();
        // Retire slot 3 out of band; nothing in the cycle re-arms it
        let slot3 = store.active_order_for_slot(coin.id, PROFILE, 3).unwrap().unwrap();
        store
            .mark_order_terminal(slot3.id, OrderState::Stopped)
            .unwrap();

        let term = DryRunTerminal::new();
        term.set_rows(vec![RowGroup {
            filter_index: 0,
            rows: vec![pending_row("Buy below $93.1K")],
        }]);

        let CycleOutcome::Completed(report) = run_cycle(&term, &store, PROFILE, 1.0).await else {
            panic!("expected a completed cycle");
        };
        assert_eq!(
            report.missing,
            vec![MissingOrders {
                coin_address: "0xstimmy".into(),
                coin_name: Some("STIMMY".into()),
                bracket: 2,
                slots: vec![3],
            }]
        );
    }

    #[tokio::test]
    async fn scrape_failure_reports_failed_cycle() {
        // A terminal whose scrape always errors
        struct BrokenTerminal;
        #[async_trait::async_trait]
        impl UiTerminal for BrokenTerminal {
            async fn search(&self, _: &str) -> crate::terminal::TerminalResult<bool> {
                Ok(false)
            }
            async fn current_capitalization(&self) -> crate::terminal::TerminalResult<f64> {
                Ok(0.0)
            }
            async fn scrape_rows(
                &self,
            ) -> crate::terminal::TerminalResult<Vec<RowGroup>> {
                Err(crate::terminal::TerminalError::Timeout("order table".into()))
            }
            async fn click_filter(&self, _: usize) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
            async fn delete_entry(&self, _: usize, _: usize) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
            async fn place_order(
                &self,
                _: crate::terminal::OrderKind,
                _: Option<f64>,
                _: f64,
            ) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
            async fn select_autosell_strategy(
                &self,
                _: &str,
                _: f64,
                _: f64,
            ) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
            async fn confirm(&self) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
            async fn close_session(&self) -> crate::terminal::TerminalResult<()> {
                Ok(())
            }
        }

        let store = Store::open_in_memory().unwrap();
        let outcome = run_cycle(&BrokenTerminal, &store, PROFILE, 1.0).await;
        assert!(matches!(outcome, CycleOutcome::Failed { .. }));
        assert!(!outcome.is_success());
    }
}
