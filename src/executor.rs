/// Order placement against the terminal
///
/// Two entry points: `place_bracket_order` arms a single slot from a
/// resolved plan (the replacement path), and `execute_bracket_strategy`
/// deploys a full four-slot bracket on a token from scratch. Both persist
/// what they place so later reconciliation cycles can match it.

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use crate::brackets::{self, BracketDefinition, SlotParams, SLOT_COUNT};
use crate::persistence::{CoinUpdate, NewOrder, OrderRecord, Store};
use crate::replacement::ReplacementPlan;
use crate::terminal::{OrderKind, UiTerminal};

/// Place one planned order and persist it. The terminal flow is fill form,
/// attach the auto-sell strategy, confirm; the order row is inserted only
/// after the terminal confirms.
pub async fn place_bracket_order(
    terminal: &dyn UiTerminal,
    store: &Store,
    profile: &str,
    address: &str,
    plan: &ReplacementPlan,
) -> Result<OrderRecord> {
    let price = match plan.kind {
        OrderKind::Market => None,
        OrderKind::Limit => Some(plan.entry_price),
    };
    terminal
        .place_order(plan.kind, price, plan.amount)
        .await
        .context("failed to fill the order form")?;

    let label = format!("Bracket{}_{}", plan.bracket, plan.slot);
    terminal
        .select_autosell_strategy(&label, plan.take_profit, plan.stop_loss)
        .await
        .context("failed to attach the auto-sell strategy")?;

    terminal
        .confirm()
        .await
        .context("failed to confirm the order")?;

    let coin = store.upsert_coin(
        address,
        &CoinUpdate {
            market_cap: Some(plan.current_market_cap),
            bracket: Some(plan.bracket),
            ..Default::default()
        },
    )?;

    let order = store.insert_order(&NewOrder {
        coin_id: coin.id,
        profile_name: profile.to_string(),
        bracket_id: plan.slot,
        market_cap: plan.current_market_cap,
        entry_price: plan.entry_price,
        take_profit: plan.take_profit,
        stop_loss: plan.stop_loss,
        amount: Some(plan.amount),
        is_market_order: Some(plan.kind == OrderKind::Market),
    })?;

    info!(
        address,
        profile,
        bracket = plan.bracket,
        slot = plan.slot,
        entry = plan.entry_price,
        kind = ?plan.kind,
        "order placed"
    );
    Ok(order)
}

/// Result of deploying a full bracket on a token
#[derive(Debug)]
pub struct StrategyReport {
    pub bracket: u8,
    pub market_cap: f64,
    pub placed: Vec<OrderRecord>,
    /// Slots that failed, with the failure reason
    pub failed: Vec<(u8, String)>,
}

/// Deploy all four slots of the bracket matching the token's current market
/// cap, splitting `total_amount` across the allocation fractions. Slot
/// failures are collected rather than aborting the remaining slots.
pub async fn execute_bracket_strategy(
    terminal: &dyn UiTerminal,
    store: &Store,
    profile: &str,
    address: &str,
    total_amount: f64,
) -> Result<StrategyReport> {
    let found = terminal
        .search(address)
        .await
        .context("terminal search failed")?;
    if !found {
        bail!("token {address} not found in the terminal");
    }

    let cap = terminal
        .current_capitalization()
        .await
        .context("failed to read market capitalization")?;
    let bracket = brackets::bracket_of(cap);
    info!(address, cap, bracket, "deploying bracket strategy");

    let mut placed = Vec::new();
    let mut failed = Vec::new();
    for params in brackets::order_parameters(bracket, total_amount) {
        let kind = if cap < params.entry_price {
            OrderKind::Market
        } else {
            OrderKind::Limit
        };
        let plan = ReplacementPlan {
            kind,
            bracket,
            slot: params.slot,
            entry_price: params.entry_price,
            take_profit: params.take_profit,
            stop_loss: params.stop_loss,
            amount: params.amount,
            current_market_cap: cap,
        };
        match place_bracket_order(terminal, store, profile, address, &plan).await {
            Ok(order) => placed.push(order),
            Err(e) => {
                error!(address, slot = params.slot, error = %e, "slot placement failed");
                failed.push((params.slot, e.to_string()));
            }
        }
    }

    Ok(StrategyReport {
        bracket,
        market_cap: cap,
        placed,
        failed,
    })
}

/// Price table a bracket strategy would use, without touching a terminal
#[derive(Debug)]
pub struct BracketPreview {
    pub definition: &'static BracketDefinition,
    pub slots: [SlotParams; SLOT_COUNT],
}

/// Preview the bracket and slot parameters for a market cap and total amount.
pub fn bracket_preview(market_cap: f64, total_amount: f64) -> BracketPreview {
    let bracket = brackets::bracket_of(market_cap);
    BracketPreview {
        definition: brackets::definition(bracket),
        slots: brackets::order_parameters(bracket, total_amount),
    }
}

// ============================================================================
// Tests
// ============================================================================
