/// BullX Auto - bracket-order lifecycle bot
/// Reconciles the trading terminal's order table against persisted bracket
/// orders, retires take-profit hits, and re-arms the consumed slots.

pub mod api;
pub mod brackets;
pub mod executor;
pub mod identify;
pub mod monitor;
pub mod persistence;
pub mod replacement;
pub mod row;
pub mod scheduler;
pub mod settings;
pub mod status;
pub mod terminal;
