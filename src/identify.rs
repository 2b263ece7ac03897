/// Fuzzy reconciliation of scraped rows against persisted orders
///
/// Scraped rows carry no stable identifier, so matching is heuristic: resolve
/// the token to a known coin, resolve the coin's bracket, then match the
/// row's entry price to a bracket slot within an absolute tolerance. The
/// tolerance absorbs display rounding in the terminal's trigger text.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::brackets::{self, SLOT_COUNT};
use crate::persistence::{CoinRecord, OrderRecord, Store};
use crate::row::{ParsedRow, parse_expiry_seconds};
use crate::status::{RowStatus, is_tp_hit};

/// Absolute tolerance when matching a displayed entry price to a slot target
pub const ENTRY_MATCH_TOLERANCE: f64 = 1000.0;

/// Nominal lifetime of a resting order, used to turn a displayed expiry
/// countdown back into an order age
const TYPICAL_ORDER_DURATION_SECS: i64 = 72 * 3600;

/// A row resolved against the store
#[derive(Debug, Clone)]
pub struct OrderMatch {
    /// The persisted order this row was matched to, when one was found
    pub order: Option<OrderRecord>,
    pub coin: CoinRecord,
    pub bracket: u8,
    /// Slot within the bracket (1-4), when resolved
    pub slot: Option<u8>,
    /// Entry price parsed from the row's trigger text
    pub entry_price: Option<f64>,
    pub bracket_entries: [f64; SLOT_COUNT],
}

/// Outcome of identifying one scraped row
#[derive(Debug, Clone)]
pub enum IdentifyOutcome {
    Matched(OrderMatch),
    /// The row's token resolves to no known coin
    NoCoin { token: String },
    /// The coin is known but has neither a stored bracket nor a usable
    /// market cap to compute one from
    NoBracket { coin: CoinRecord },
}

/// Resolve one scraped row to a coin, bracket and (when possible) a persisted
/// ACTIVE order for `profile`.
pub fn identify(
    store: &Store,
    profile: &str,
    row: &ParsedRow,
    status: RowStatus,
) -> Result<IdentifyOutcome> {
    let Some(coin) = resolve_coin(store, &row.token)? else {
        return Ok(IdentifyOutcome::NoCoin {
            token: row.token.clone(),
        });
    };

    let Some(bracket) = resolve_bracket(store, &coin)? else {
        return Ok(IdentifyOutcome::NoBracket { coin });
    };

    let active = store.active_orders_for(coin.id, profile)?;
    let order = match_order(&active, row, status, &coin);

    if let Some(order) = &order {
        refresh_trigger(store, order, row)?;
    }

    Ok(IdentifyOutcome::Matched(OrderMatch {
        slot: order.as_ref().map(|o| o.bracket_id),
        order,
        bracket,
        entry_price: row.entry_price,
        bracket_entries: brackets::definition(bracket).entries,
        coin,
    }))
}

/// Resolve a scraped token symbol to a stored coin: exact name first, then a
/// case-insensitive substring scan over names and addresses.
fn resolve_coin(store: &Store, token: &str) -> Result<Option<CoinRecord>> {
    if token.is_empty() {
        return Ok(None);
    }
    if let Some(coin) = store.coin_by_name(token)? {
        return Ok(Some(coin));
    }

    let needle = token.to_lowercase();
    for coin in store.all_coins()? {
        let name_hit = coin
            .name
            .as_deref()
            .is_some_and(|n| n.to_lowercase().contains(&needle));
        if name_hit || coin.address.to_lowercase().contains(&needle) {
            debug!(token, address = %coin.address, "coin matched by substring");
            return Ok(Some(coin));
        }
    }
    Ok(None)
}

/// Resolve the coin's bracket: prefer the stored bracket, otherwise compute
/// one from the stored market cap and persist it for the next cycle.
fn resolve_bracket(store: &Store, coin: &CoinRecord) -> Result<Option<u8>> {
    if let Some(bracket) = coin.bracket {
        return Ok(Some(bracket));
    }
    match coin.market_cap {
        Some(cap) if cap > 0.0 => {
            let bracket = brackets::bracket_of(cap);
            store.set_coin_bracket(coin.id, bracket)?;
            debug!(address = %coin.address, cap, bracket, "bracket computed from stored cap");
            Ok(Some(bracket))
        }
        _ => Ok(None),
    }
}

/// Match a row to one of the coin's ACTIVE orders, trying the precise
/// methods before the fallback:
///
/// 1. exact match on the stored trigger text,
/// 2. entry price within the tolerance, first ascending slot,
/// 3. expiry countdown against each order's age,
/// 4. first ACTIVE order as a last resort.
///
/// Fulfilled rows show a token amount instead of an entry price, so they
/// stop short of the last-resort fallback.
fn match_order(
    active: &[OrderRecord],
    row: &ParsedRow,
    status: RowStatus,
    coin: &CoinRecord,
) -> Option<OrderRecord> {
    if !row.trigger_condition.is_empty() {
        for order in active {
            if order.trigger_condition.as_deref() == Some(row.trigger_condition.as_str()) {
                debug!(address = %coin.address, slot = order.bracket_id, "exact trigger match");
                return Some(order.clone());
            }
        }
    }

    if let Some(price) = row.entry_price {
        for order in active {
            if (order.entry_price - price).abs() <= ENTRY_MATCH_TOLERANCE {
                return Some(order.clone());
            }
        }
    }

    // Only meaningful when there is a choice to make
    if active.len() > 1 {
        if let Some(order) = match_by_expiry(active, row) {
            debug!(address = %coin.address, slot = order.bracket_id, "expiry match");
            return Some(order.clone());
        }
    }

    if status == RowStatus::Fulfilled && row.entry_price.is_none() {
        return None;
    }

    match active.first() {
        Some(order) => {
            warn!(
                address = %coin.address,
                slot = order.bracket_id,
                entry_price = ?row.entry_price,
                "no precise match; falling back to first ACTIVE order"
            );
            Some(order.clone())
        }
        None => None,
    }
}

/// Match by expiry countdown: the displayed remaining time implies how long
/// ago the order was placed (nominal lifetime minus remaining), and the
/// ACTIVE order whose age is closest wins. TP rows age from `updated_at`
/// because the terminal resets the countdown when the entry executes; entry
/// rows age from `created_at`.
fn match_by_expiry<'a>(active: &'a [OrderRecord], row: &ParsedRow) -> Option<&'a OrderRecord> {
    let remaining = parse_expiry_seconds(&row.expiry)? as i64;
    let expected_age = TYPICAL_ORDER_DURATION_SECS - remaining;
    let tp_row =
        is_tp_hit(&row.trigger_condition) || row.trigger_condition.to_uppercase().contains("TP");
    let now_ms = Utc::now().timestamp_millis();

    active.iter().min_by_key(|order| {
        let reference_ms = if tp_row {
            order.updated_at_ms
        } else {
            order.created_at_ms
        };
        let age = (now_ms - reference_ms) / 1000;
        (age - expected_age).abs()
    })
}

/// Persist the row's trigger text onto the matched order when it changed, so
/// the stored order always reflects the last observed terminal state.
fn refresh_trigger(store: &Store, order: &OrderRecord, row: &ParsedRow) -> Result<()> {
    if row.trigger_condition.is_empty() {
        return Ok(());
    }
    if order.trigger_condition.as_deref() != Some(row.trigger_condition.as_str()) {
        store.update_trigger_condition(order.id, &row.trigger_condition)?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
