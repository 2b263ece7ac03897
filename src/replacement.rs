/// Replacement planning for consumed bracket slots
///
/// When a take-profit hit retires a slot, the slot is re-armed with a fresh
/// order at the same bracket's price table. Planning navigates to the token,
/// refreshes its market cap, and decides market-vs-limit from where the
/// current cap sits relative to the slot's entry target.

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::brackets;
use crate::persistence::{CoinUpdate, Store};
use crate::terminal::{OrderKind, UiTerminal};

/// One consumed slot queued for re-arming
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementJob {
    pub coin_address: String,
    /// Bracket of the retired order; replacements stay in this bracket
    pub bracket: u8,
    /// Slot within the bracket (1-4)
    pub slot: u8,
    pub amount: f64,
}

/// Fully resolved parameters for one replacement order
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementPlan {
    pub kind: OrderKind,
    pub bracket: u8,
    pub slot: u8,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub amount: f64,
    pub current_market_cap: f64,
}

/// Plan one replacement order. Navigates the terminal to the token, refreshes
/// the stored market cap, and derives the slot parameters.
///
/// The original bracket is preserved even when the current cap has drifted
/// into another tier: the retired order's sibling slots are still armed at
/// the original bracket's price points, and mixing tiers within one coin
/// would break slot matching on later cycles.
pub async fn plan(
    terminal: &dyn UiTerminal,
    store: &Store,
    job: &ReplacementJob,
) -> Result<ReplacementPlan> {
    let found = terminal
        .search(&job.coin_address)
        .await
        .context("terminal search failed")?;
    if !found {
        bail!("token {} not found in the terminal", job.coin_address);
    }

    let cap = terminal
        .current_capitalization()
        .await
        .context("failed to read market capitalization")?;

    store.upsert_coin(
        &job.coin_address,
        &CoinUpdate {
            market_cap: Some(cap),
            ..Default::default()
        },
    )?;

    let cap_bracket = brackets::bracket_of(cap);
    if cap_bracket != job.bracket {
        warn!(
            address = %job.coin_address,
            original = job.bracket,
            current = cap_bracket,
            cap,
            "market cap drifted into another bracket; keeping the original"
        );
    }

    let params = brackets::slot_parameters(job.bracket, job.slot, job.amount);
    // Entry already satisfied at the current cap: take it immediately
    let kind = if cap < params.entry_price {
        OrderKind::Market
    } else {
        OrderKind::Limit
    };
    debug!(
        address = %job.coin_address,
        bracket = job.bracket,
        slot = job.slot,
        entry = params.entry_price,
        cap,
        ?kind,
        "replacement planned"
    );

    Ok(ReplacementPlan {
        kind,
        bracket: job.bracket,
        slot: params.slot,
        entry_price: params.entry_price,
        take_profit: params.take_profit,
        stop_loss: params.stop_loss,
        amount: job.amount,
        current_market_cap: cap,
    })
}

// ============================================================================
// Tests
// ============================================================================
