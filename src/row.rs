/// Row parser for the order table scraped from the trading terminal
///
/// Each scraped row is a free-form multi-line text block. Line positions map
/// to fixed semantic fields; missing positions yield empty strings rather
/// than errors so partially rendered rows still reconcile. The scraped text
/// is treated as an external wire format even though it is "just UI text".

use tracing::warn;

/// Expected number of lines in a fully rendered row
const EXPECTED_LINES: usize = 11;

/// Canonical field set parsed from one scraped row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRow {
    pub raw_text: String,
    pub link: Option<String>,
    /// e.g. "Auto"
    pub side: String,
    /// e.g. "Sell"
    pub kind: String,
    /// Token symbol, e.g. "STIMMY"
    pub token: String,
    /// Displayed amount; switches from cash to token denomination on execution
    pub order_amount: String,
    pub cost: String,
    pub avg_exec: String,
    /// Time to expiry, e.g. "63h 09m 52s"
    pub expiry: String,
    pub wallets: String,
    pub transactions: String,
    /// Trigger/condition text, e.g. "Buy below $231K" or "1 TP, 1 SL"
    pub trigger_condition: String,
    pub status_text: String,
    /// Entry price extracted from the trigger text, when present
    pub entry_price: Option<f64>,
}

/// Parse one scraped row into its canonical field set.
/// Returns `None` only when the text block is empty (unparseable).
pub fn parse_row(text: &str, link: Option<&str>) -> Option<ParsedRow> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return None;
    }
    if lines.len() < EXPECTED_LINES {
        warn!(lines = lines.len(), "row has fewer than expected columns");
    }

    let field = |i: usize| lines.get(i).copied().unwrap_or("").to_string();

    let trigger_condition = field(9);
    Some(ParsedRow {
        raw_text: text.to_string(),
        link: link.map(str::to_string),
        side: field(0),
        kind: field(1),
        token: field(2),
        order_amount: field(3),
        cost: field(4),
        avg_exec: field(5),
        expiry: field(6),
        wallets: field(7),
        transactions: field(8),
        entry_price: parse_entry_price(&trigger_condition),
        trigger_condition,
        status_text: field(10),
    })
}

/// Extract the target entry capitalization from a trigger condition.
///
/// Recognized pattern: `Buy below $<number><suffix?>` where the suffix is one
/// of k/K (1e3), m/M (1e6), b/B (1e9). Anything else yields `None`, which is
/// a normal outcome (TP/SL-only triggers carry no entry price).
pub fn parse_entry_price(trigger: &str) -> Option<f64> {
    let rest = trigger.split("Buy below $").nth(1)?;

    let mut number = String::new();
    let mut suffix = None;
    for c in rest.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            suffix = Some(c);
            break;
        }
    }
    if number.is_empty() {
        return None;
    }

    let mut value: f64 = number.parse().ok()?;
    match suffix.map(|c| c.to_ascii_lowercase()) {
        Some('k') => value *= 1e3,
        Some('m') => value *= 1e6,
        Some('b') => value *= 1e9,
        _ => {}
    }
    Some(value)
}

/// Parse an expiry string of the form `"XXh XXm XXs"` into total seconds.
pub fn parse_expiry_seconds(expiry: &str) -> Option<u64> {
    let mut parts = expiry.split_whitespace();
    let hours: u64 = parts.next()?.strip_suffix('h')?.parse().ok()?;
    let minutes: u64 = parts.next()?.strip_suffix('m')?.parse().ok()?;
    let seconds: u64 = parts.next()?.strip_suffix('s')?.parse().ok()?;
    Some(hours * 3600 + minutes * 60 + seconds)
}

// ============================================================================
// Tests
// ============================================================================
