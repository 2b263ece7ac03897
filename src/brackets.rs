/// Bracket table for the multi-order system
/// Maps market-capitalization ranges to brackets 1-5 and derives the
/// per-slot entry/TP/SL price points and capital allocations.

// ============================================================================
// Static tables
// ============================================================================

/// Number of sub-orders placed per bracket
pub const SLOT_COUNT: usize = 4;

/// Capital allocation per slot (fractions of the total investment).
/// Must sum to 1.0; checked by `validate()`.
pub const ALLOCATIONS: [f64; SLOT_COUNT] = [1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0, 1.0 / 6.0];

/// Take-profit multiplier per slot: tp = entry + entry * multiplier
pub const TAKE_PROFIT_MULTIPLIERS: [f64; SLOT_COUNT] = [1.12, 0.89, 0.81, 0.56];

/// One market-cap tier with its price table
#[derive(Debug, Clone, Copy)]
pub struct BracketDefinition {
    pub bracket: u8,
    /// Inclusive lower bound of the market-cap range
    pub min_market_cap: f64,
    /// Exclusive upper bound of the market-cap range
    pub max_market_cap: f64,
    /// Single stop-loss capitalization shared by all four slots
    pub stop_loss_market_cap: f64,
    /// Entry-price targets for slots 1-4, ascending
    pub entries: [f64; SLOT_COUNT],
    pub description: &'static str,
}

pub static BRACKETS: [BracketDefinition; 5] = [
    BracketDefinition {
        bracket: 1,
        min_market_cap: 20_000.0,
        max_market_cap: 200_000.0,
        stop_loss_market_cap: 7_800.0,
        entries: [9_310.0, 13_100.0, 23_100.0, 33_100.0],
        description: "Micro Cap (20K - 200K)",
    },
    BracketDefinition {
        bracket: 2,
        min_market_cap: 200_000.0,
        max_market_cap: 2_000_000.0,
        stop_loss_market_cap: 78_000.0,
        entries: [93_100.0, 131_000.0, 231_000.0, 331_000.0],
        description: "Small Cap (200K - 2M)",
    },
    BracketDefinition {
        bracket: 3,
        min_market_cap: 2_000_000.0,
        max_market_cap: 20_000_000.0,
        stop_loss_market_cap: 780_000.0,
        entries: [931_000.0, 1_310_000.0, 2_310_000.0, 3_310_000.0],
        description: "Medium Cap (2M - 20M)",
    },
    BracketDefinition {
        bracket: 4,
        min_market_cap: 20_000_000.0,
        max_market_cap: 120_000_000.0,
        stop_loss_market_cap: 7_800_000.0,
        entries: [9_310_000.0, 13_100_000.0, 23_100_000.0, 33_100_000.0],
        description: "Large Cap (20M - 120M)",
    },
    BracketDefinition {
        bracket: 5,
        min_market_cap: 120_000_000.0,
        max_market_cap: 1_200_000_000.0,
        stop_loss_market_cap: 78_000_000.0,
        entries: [93_100_000.0, 131_000_000.0, 231_000_000.0, 331_000_000.0],
        description: "Mega Cap (120M - 1.2B)",
    },
];

// ============================================================================
// Pure functions
// ============================================================================

/// Classify a market cap into a bracket using half-open ranges [min, max).
/// Caps outside every defined range fall back to bracket 1.
#[inline]
pub fn bracket_of(market_cap: f64) -> u8 {
    for def in &BRACKETS {
        if market_cap >= def.min_market_cap && market_cap < def.max_market_cap {
            return def.bracket;
        }
    }
    1
}

/// Look up a bracket definition. Unknown bracket numbers fall back to bracket 1,
/// mirroring the `bracket_of` fallback.
pub fn definition(bracket: u8) -> &'static BracketDefinition {
    BRACKETS
        .iter()
        .find(|d| d.bracket == bracket)
        .unwrap_or(&BRACKETS[0])
}

/// Computed parameters for one sub-order slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotParams {
    /// Slot within the bracket (1-4)
    pub slot: u8,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub amount: f64,
    pub allocation: f64,
    pub tp_multiplier: f64,
}

/// Compute parameters for a single slot of a bracket.
/// Capitalization values are used directly as price targets.
pub fn slot_parameters(bracket: u8, slot: u8, amount: f64) -> SlotParams {
    let def = definition(bracket);
    let i = (slot.clamp(1, SLOT_COUNT as u8) - 1) as usize;
    let entry_price = def.entries[i];
    SlotParams {
        slot: i as u8 + 1,
        entry_price,
        take_profit: entry_price + entry_price * TAKE_PROFIT_MULTIPLIERS[i],
        stop_loss: def.stop_loss_market_cap,
        amount,
        allocation: ALLOCATIONS[i],
        tp_multiplier: TAKE_PROFIT_MULTIPLIERS[i],
    }
}

/// Compute parameters for all four slots of a bracket, splitting `total_amount`
/// by the allocation fractions.
pub fn order_parameters(bracket: u8, total_amount: f64) -> [SlotParams; SLOT_COUNT] {
    let mut out = [slot_parameters(bracket, 1, 0.0); SLOT_COUNT];
    for (i, p) in out.iter_mut().enumerate() {
        let slot = i as u8 + 1;
        *p = slot_parameters(bracket, slot, total_amount * ALLOCATIONS[i]);
    }
    out
}

/// Self-check the static tables. Returns a list of problems; an empty list
/// means the configuration is consistent. Startup treats a non-empty list as
/// a hard failure.
pub fn validate() -> Vec<String> {
    let mut errors = Vec::new();

    for expected in 1..=5u8 {
        if !BRACKETS.iter().any(|d| d.bracket == expected) {
            errors.push(format!("missing definition for bracket {expected}"));
        }
    }

    for def in &BRACKETS {
        if def.min_market_cap >= def.max_market_cap {
            errors.push(format!(
                "bracket {} has an empty market-cap range [{}, {})",
                def.bracket, def.min_market_cap, def.max_market_cap
            ));
        }
        if def.entries.len() != SLOT_COUNT {
            errors.push(format!(
                "bracket {} must have exactly {} entries, got {}",
                def.bracket,
                SLOT_COUNT,
                def.entries.len()
            ));
        }
        let mut prev = f64::MIN;
        for entry in def.entries {
            if entry <= prev {
                errors.push(format!(
                    "bracket {} entries are not strictly ascending",
                    def.bracket
                ));
                break;
            }
            prev = entry;
        }
    }

    if ALLOCATIONS.len() != SLOT_COUNT {
        errors.push(format!(
            "allocations must have exactly {SLOT_COUNT} values, got {}",
            ALLOCATIONS.len()
        ));
    }
    if TAKE_PROFIT_MULTIPLIERS.len() != SLOT_COUNT {
        errors.push(format!(
            "take-profit multipliers must have exactly {SLOT_COUNT} values, got {}",
            TAKE_PROFIT_MULTIPLIERS.len()
        ));
    }

    let total: f64 = ALLOCATIONS.iter().sum();
    if (total - 1.0).abs() > 0.001 {
        errors.push(format!("allocations should sum to 1.0, got {total}"));
    }

    errors
}

// ============================================================================
// Tests
// ============================================================================
