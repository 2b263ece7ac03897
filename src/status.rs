/// Status classifier for parsed order rows
///
/// Lifecycle status is derived from heuristic text patterns in an explicit,
/// ordered rule table: first matching rule wins, so new patterns can be added
/// without disturbing precedence.

use crate::row::ParsedRow;

/// Coarse lifecycle status of a scraped order row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// Countdown ran out before the order executed
    Expired,
    /// The order executed; both TP and SL legs are armed
    Fulfilled,
    /// Entry condition still waiting to trigger
    Pending,
    Unknown,
}

struct Rule {
    name: &'static str,
    status: RowStatus,
    matches: fn(&ParsedRow) -> bool,
}

/// Ordered classification rules; order is load-bearing. The expiry rule is
/// checked before the fulfilled rules, so an expired row that also shows
/// "1 TP, 1 SL" classifies as Expired.
const RULES: [Rule; 4] = [
    Rule {
        name: "expired_countdown",
        status: RowStatus::Expired,
        matches: |row| row.expiry == "00h 00m 00s",
    },
    Rule {
        name: "fulfilled_tp_sl_armed",
        status: RowStatus::Fulfilled,
        matches: |row| row.trigger_condition == "1 TP, 1 SL",
    },
    // The amount field switches from a cash value to a token-denominated
    // value once the order executes.
    Rule {
        name: "fulfilled_token_amount",
        status: RowStatus::Fulfilled,
        matches: |row| {
            !row.token.is_empty()
                && row
                    .order_amount
                    .to_lowercase()
                    .contains(&row.token.to_lowercase())
        },
    },
    Rule {
        name: "pending_entry",
        status: RowStatus::Pending,
        matches: |row| row.trigger_condition.starts_with("Buy below"),
    },
];

/// Classify a parsed row; first matching rule wins.
pub fn classify(row: &ParsedRow) -> RowStatus {
    for rule in &RULES {
        if (rule.matches)(row) {
            tracing::trace!(rule = rule.name, "row classified");
            return rule.status;
        }
    }
    RowStatus::Unknown
}

/// Take-profit-hit detector, used by the reconciliation path.
///
/// A trigger showing only a stop-loss leg means the take-profit leg has
/// already been consumed. Distinct from the Fulfilled classification above.
pub fn is_tp_hit(trigger_condition: &str) -> bool {
    trigger_condition.trim() == "1 SL"
}

// ============================================================================
// Tests
// ============================================================================
