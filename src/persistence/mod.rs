/// SQLite-backed persistence for coins, orders, profiles and cycle audits

mod store;

pub use store::{
    CoinRecord, CoinUpdate, NewOrder, NewTask, OrderRecord, OrderState, ProfileRecord, Store,
    TaskRecord, TaskStats,
};
